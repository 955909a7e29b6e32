pub mod mock;
pub mod webhook;

pub use mock::{Delivery, MockSender};
pub use webhook::WebhookSender;
