//! Implementation of the CoAP message layer ([RFC 7252]).
//!
//! This library turns a UDP socket into the CoAP request/response
//! abstraction: confirmable and non-confirmable exchanges, duplicate
//! suppression, piggy-backed and separate responses, message-ID allocation
//! and retransmission with exponential back-off. It provides a server
//! interface ([`Server`]) that routes requests to registered
//! [`Webservice`]s, and a client interface ([`CoapClient`]) driven by the
//! same reliability core. The wire codec comes from [`coap_lite`].
//!
//! [RFC 7252]: https://tools.ietf.org/rfc/rfc7252.txt
//!
//! # Example
//!
//! ## Server:
//! ```no_run
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//! use ucoap::{CoapRequest, FnService, Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut server = Server::new("127.0.0.1:5683").await.unwrap();
//!     server.register(Arc::new(FnService::new(
//!         "/hello",
//!         |request: CoapRequest<SocketAddr>| {
//!             request.response.map(|mut response| {
//!                 response.message.payload = b"world".to_vec();
//!                 response
//!             })
//!         },
//!     )));
//!     server.run().await.unwrap();
//! }
//! ```
//!
//! ## Client:
//! ```no_run
//! use ucoap::CoapClient;
//!
//! #[tokio::main]
//! async fn main() {
//!     let response = CoapClient::get("coap://127.0.0.1:5683/hello").await.unwrap();
//!     println!("Server reply: {}", String::from_utf8(response.message.payload).unwrap());
//! }
//! ```

pub use coap_lite::{
    CoapOption, CoapRequest, CoapResponse, MessageClass, MessageType, Packet,
    RequestType as Method, ResponseType as Status,
};

pub use self::client::CoapClient;
pub use self::error::Error;
pub use self::params::TransmissionParameters;
pub use self::server::Server;
pub use self::service::{Dispatcher, FnService, ResponsePromise, Webservice};

pub mod client;
pub mod error;
pub mod params;
pub mod reliability;
pub mod server;
pub mod service;
