pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod session;
pub mod time;

pub use errors::RelayError;
pub use events::{DeliveryPayload, StreamEvent, CONNECTED_NOTICE};
pub use ids::{MessageId, SessionId};
pub use messages::{Message, MessageKind};
pub use session::{ProcessStatus, SessionState, SessionStatus, DEFAULT_USER_ID};
