// Message module: envelope, payload types, wire codec and signing

pub mod auth;
pub mod codec;
pub mod types;

pub use auth::{authenticate, new_message_data, sign, sign_in_place, verify, AuthFailure, SigningError};
pub use codec::{decode_frame, encode_frame, signing_bytes, MAX_MESSAGE_SIZE, MAX_PAYLOAD_SIZE};
pub use types::{EchoRequest, EchoResponse, MessageData, PingRequest, PingResponse, Signed};
