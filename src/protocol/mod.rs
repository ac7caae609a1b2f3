//! Push channel wire protocol
//!
//! Control line encoding, frame decoding, push payloads and subject naming.

pub mod codec;
pub mod messages;
pub mod subjects;

pub use codec::{ConnectOptions, InboundFrame, MessageFrame, ProtocolCodec, ProtocolError};
pub use messages::{LicenseGranted, PaymentRejected, PushMessage};
pub use subjects::{device_subject, validate_subject_token, SubjectError};
