// ABOUTME: Wire protocol: message types, header codec and payload serialization
// ABOUTME: Re-exports the types every other module speaks in

pub mod messages;

pub use messages::{BaseMessage, EncodedFrame, MessagePayload, MessageType, Tv};
