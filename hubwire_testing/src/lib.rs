//! Utilities for driving `hubwire` clients in tests without a broker.
//!
//! [`MockTransport`] stands in for the MQTT connection: it records every call
//! the pipeline makes and answers with the acknowledgements a broker would
//! send, unless told to stay quiet or to fail.
//!
//! ```rust
//! use hubwire::{ClientOptions, Message, SyncDeviceClient};
//! use hubwire_testing::{Call, MockTransport};
//!
//! let transport = MockTransport::new();
//! let client = SyncDeviceClient::create_from_connection_string(
//!     "HostName=hub.example.net;DeviceId=dev;SharedAccessKey=Zm9vYmFy",
//!     ClientOptions::default().transport(transport.factory()),
//! )
//! .expect("client");
//! client.send_message(Message::new("hi")).expect("send");
//! assert!(matches!(transport.calls().first(), Some(Call::Connect { .. })));
//! client.shutdown();
//! ```

mod logging;
mod transport;

pub use logging::{LoggerHandle, logger};
pub use transport::{Call, MockTransport, request_id};
