use coap_lite::{CoapOption, CoapRequest, CoapResponse, MessageType, Packet, RequestType as Method};
use log::{debug, warn};
use std::io::{Error as IoError, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use url::Url;

use crate::error::Error;
use crate::params::TransmissionParameters;
use crate::reliability::empty_reset;
use crate::reliability::exchange::ExchangeRegistry;
use crate::reliability::incoming::{InboundEvent, IncomingReliabilityHandler};
use crate::reliability::message_id::MessageIdFactory;
use crate::reliability::outgoing::OutgoingReliabilityHandler;
use crate::reliability::retransmission::{ConfirmableOutcome, RetransmissionScheduler};
use crate::server::{MessageReceiver, MessageSender, MAX_DATAGRAM_SIZE};

/// A CoAP client on its own ephemeral UDP socket, driven by the same
/// reliability core as the server.
///
/// Confirmable requests are retransmitted with exponential back-off until
/// acknowledged; separate responses are acknowledged automatically and
/// matched back to the request by token. Non-confirmable requests fire once
/// and wait for a non-confirmable response.
pub struct CoapClient {
    peer_addr: SocketAddr,
    params: TransmissionParameters,
    exchanges: Arc<ExchangeRegistry>,
    outgoing: Arc<OutgoingReliabilityHandler>,
    reactor: JoinHandle<()>,
}

impl CoapClient {
    /// Creates a client talking to `peer_addr` with RFC 7252 default
    /// transmission parameters.
    pub async fn new<A: ToSocketAddrs>(peer_addr: A) -> std::io::Result<CoapClient> {
        Self::with_parameters(peer_addr, TransmissionParameters::default()).await
    }

    pub async fn with_parameters<A: ToSocketAddrs>(
        peer_addr: A,
        params: TransmissionParameters,
    ) -> std::io::Result<CoapClient> {
        let peer_addr = tokio::net::lookup_host(peer_addr)
            .await?
            .next()
            .ok_or_else(|| IoError::new(ErrorKind::Other, "no address"))?;

        let bind_addr: SocketAddr = match peer_addr {
            SocketAddr::V4(_) => "0.0.0.0:0".parse().unwrap(),
            SocketAddr::V6(_) => "[::]:0".parse().unwrap(),
        };
        let socket = UdpSocket::bind(bind_addr).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let exchanges = ExchangeRegistry::new(params.exchange_lifetime);
        let message_ids = Arc::new(MessageIdFactory::new(params.exchange_lifetime));
        let scheduler = Arc::new(RetransmissionScheduler::new(params.clone(), tx.clone()));
        let incoming =
            IncomingReliabilityHandler::new(params.clone(), Arc::clone(&exchanges), tx.clone());
        let outgoing = Arc::new(OutgoingReliabilityHandler::new(
            Arc::clone(&exchanges),
            message_ids,
            scheduler,
            tx.clone(),
        ));

        let reactor = tokio::spawn(reactor(
            socket,
            rx,
            tx,
            incoming,
            Arc::clone(&outgoing),
            Arc::clone(&exchanges),
        ));

        Ok(CoapClient {
            peer_addr,
            params,
            exchanges,
            outgoing,
            reactor,
        })
    }

    /// Executes a single GET request against a coap URL.
    pub async fn get(url: &str) -> Result<CoapResponse, Error> {
        Self::request_url(url, Method::Get, None).await
    }

    /// Executes a single POST request against a coap URL.
    pub async fn post(url: &str, data: Vec<u8>) -> Result<CoapResponse, Error> {
        Self::request_url(url, Method::Post, Some(data)).await
    }

    /// Executes a single PUT request against a coap URL.
    pub async fn put(url: &str, data: Vec<u8>) -> Result<CoapResponse, Error> {
        Self::request_url(url, Method::Put, Some(data)).await
    }

    /// Executes a single DELETE request against a coap URL.
    pub async fn delete(url: &str) -> Result<CoapResponse, Error> {
        Self::request_url(url, Method::Delete, None).await
    }

    async fn request_url(url: &str, method: Method, data: Option<Vec<u8>>) -> Result<CoapResponse, Error> {
        let (host, port, path, queries) = parse_coap_url(url)?;
        let client = CoapClient::new((host.as_str(), port)).await?;

        let mut request: CoapRequest<SocketAddr> = CoapRequest::new();
        request.set_method(method);
        request.set_path(&path);
        if let Some(queries) = queries {
            request.message.add_option(CoapOption::UriQuery, queries);
        }
        if let Some(data) = data {
            request.message.payload = data;
        }

        client.request(request).await
    }

    /// Performs one request/response exchange with the connected peer.
    ///
    /// The message type of the request decides the exchange style: CON goes
    /// through the retransmission scheduler and resolves on a piggy-backed
    /// or separate response, NON is transmitted once. A missing token is
    /// filled in with a random 4-byte value.
    pub async fn request(&self, request: CoapRequest<SocketAddr>) -> Result<CoapResponse, Error> {
        let mut message = request.message;
        if message.get_token().is_empty() {
            message.set_token(rand::random::<u32>().to_be_bytes().to_vec());
        }
        let token = message.get_token().to_vec();
        let kind = message.header.get_type();

        // Register the response waiter before anything hits the wire, so
        // even an immediate separate response finds it.
        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.exchanges
            .register_waiter(self.peer_addr, token.clone(), waiter_tx);

        let result = match kind {
            MessageType::NonConfirmable => self.exchange_non_confirmable(message, waiter_rx).await,
            _ => self.exchange_confirmable(message, waiter_rx).await,
        };

        self.exchanges.remove_waiter(self.peer_addr, &token);
        result
    }

    async fn exchange_confirmable(
        &self,
        message: Packet,
        waiter: oneshot::Receiver<Packet>,
    ) -> Result<CoapResponse, Error> {
        let outcome = self.outgoing.send_confirmable(self.peer_addr, message)?;

        match outcome.await {
            Ok(ConfirmableOutcome::Acknowledged {
                response: Some(message),
            }) => Ok(CoapResponse { message }),
            Ok(ConfirmableOutcome::Acknowledged { response: None }) => {
                // Empty ACK: the peer will send a separate response.
                debug!("request acknowledged, awaiting separate response");
                match timeout(self.params.exchange_lifetime, waiter).await {
                    Ok(Ok(message)) => Ok(CoapResponse { message }),
                    Ok(Err(_)) | Err(_) => Err(Error::ConfirmableTimeout),
                }
            }
            Ok(ConfirmableOutcome::Reset) => Err(Error::PeerReset),
            Ok(ConfirmableOutcome::TimedOut) => Err(Error::ConfirmableTimeout),
            Err(_) => Err(Error::ConfirmableTimeout),
        }
    }

    async fn exchange_non_confirmable(
        &self,
        message: Packet,
        waiter: oneshot::Receiver<Packet>,
    ) -> Result<CoapResponse, Error> {
        self.outgoing.send_non_confirmable(self.peer_addr, message)?;

        match timeout(self.params.non_lifetime, waiter).await {
            Ok(Ok(message)) => Ok(CoapResponse { message }),
            Ok(Err(_)) | Err(_) => Err(Error::Network(IoError::new(
                ErrorKind::TimedOut,
                "no response to non-confirmable request",
            ))),
        }
    }
}

impl Drop for CoapClient {
    fn drop(&mut self) {
        self.reactor.abort();
    }
}

/// The client's half of the reactor: owns the socket, serializes reads and
/// writes, feeds inbound traffic through the reliability layer.
async fn reactor(
    socket: UdpSocket,
    mut rx: MessageReceiver,
    tx: MessageSender,
    incoming: IncomingReliabilityHandler,
    outgoing: Arc<OutgoingReliabilityHandler>,
    exchanges: Arc<ExchangeRegistry>,
) {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (nread, src) = match received {
                    Ok(received) => received,
                    Err(error) => {
                        warn!("client socket receive failed: {}", error);
                        return;
                    }
                };
                let message = match Packet::from_bytes(&buf[..nread]) {
                    Ok(message) => message,
                    Err(_) => {
                        debug!("dropping unparseable datagram from {}", src);
                        continue;
                    }
                };
                match incoming.handle(message, src) {
                    InboundEvent::Response(message) => {
                        let token = message.get_token().to_vec();
                        if !exchanges.resolve_waiter(src, &token, message) {
                            debug!("no request waiting for token {:?} from {}", token, src);
                        }
                    }
                    InboundEvent::Acknowledgement { message_id, response } => {
                        outgoing.acknowledged(src, message_id, response);
                    }
                    InboundEvent::Reset { message_id } => {
                        outgoing.reset_received(src, message_id);
                    }
                    InboundEvent::Request(request) => {
                        // This endpoint serves nothing; claim the exchange so
                        // no empty ACK follows, then reject with a reset.
                        let message_id = request.message.header.message_id;
                        exchanges.claim_response(src, message_id);
                        let _ = tx.send((empty_reset(message_id), src));
                    }
                    InboundEvent::Handled => {}
                }
            }
            queued = rx.recv() => {
                let (message, dst) = match queued {
                    Some(queued) => queued,
                    None => return,
                };
                match message.to_bytes() {
                    Ok(bytes) => {
                        if let Err(error) = socket.send_to(&bytes[..], dst).await {
                            warn!("client socket send failed: {}", error);
                            return;
                        }
                    }
                    Err(error) => warn!("failed to encode outbound message: {:?}", error),
                }
            }
        }
    }
}

fn parse_coap_url(url: &str) -> Result<(String, u16, String, Option<Vec<u8>>), Error> {
    let url_params =
        Url::parse(url).map_err(|_| IoError::new(ErrorKind::InvalidInput, "url error"))?;

    let host = match url_params.host_str() {
        Some("") | None => return Err(IoError::new(ErrorKind::InvalidInput, "host error").into()),
        Some(host) => host,
    };
    // Bracketed IPv6 literals bind without the brackets.
    let host = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();

    let port = url_params.port().unwrap_or(5683);
    let path = url_params.path().to_string();
    let queries = url_params.query().map(|q| q.as_bytes().to_vec());

    Ok((host, port, path, queries))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::server::Server;
    use crate::service::FnService;
    use coap_lite::ResponseType;

    #[test]
    fn test_parse_coap_url_good_url() {
        assert!(parse_coap_url("coap://127.0.0.1").is_ok());
        assert!(parse_coap_url("coap://127.0.0.1:5683").is_ok());
        assert!(parse_coap_url("coap://[::1]").is_ok());
        assert!(parse_coap_url("coap://[::1]:5683").is_ok());
        assert!(parse_coap_url("coap://[bbbb::9329:f033:f558:7418]").is_ok());
        assert!(parse_coap_url("coap://[bbbb::9329:f033:f558:7418]:5683").is_ok());
        assert!(parse_coap_url("coap://127.0.0.1/?hello=world").is_ok());
    }

    #[test]
    fn test_parse_coap_url_bad_url() {
        assert!(parse_coap_url("coap://127.0.0.1:65536").is_err());
        assert!(parse_coap_url("coap://").is_err());
        assert!(parse_coap_url("coap://:5683").is_err());
        assert!(parse_coap_url("127.0.0.1").is_err());
    }

    #[test]
    fn test_parse_coap_url_parts() {
        let (host, port, path, queries) =
            parse_coap_url("coap://example.net:5699/sensors/temp?u=C").unwrap();
        assert_eq!(host, "example.net");
        assert_eq!(port, 5699);
        assert_eq!(path, "/sensors/temp");
        assert_eq!(queries, Some(b"u=C".to_vec()));
    }

    #[tokio::test]
    async fn test_get_url() {
        let mut server = Server::new("127.0.0.1:0").await.unwrap();
        let port = server.socket_addr().unwrap().port();
        server.register(Arc::new(FnService::new(
            "/hello",
            |request: CoapRequest<SocketAddr>| {
                request.response.map(|mut response| {
                    response.message.payload = b"world".to_vec();
                    response
                })
            },
        )));
        tokio::spawn(async move { server.run().await });

        let response = CoapClient::get(&format!("coap://127.0.0.1:{}/hello", port))
            .await
            .unwrap();
        assert_eq!(response.message.payload, b"world".to_vec());
        assert_eq!(*response.get_status(), ResponseType::Content);
    }

    #[tokio::test]
    async fn test_non_confirmable_round_trip() {
        let mut server = Server::new("127.0.0.1:0").await.unwrap();
        let addr = server.socket_addr().unwrap();
        server.register(Arc::new(FnService::new(
            "/non",
            |request: CoapRequest<SocketAddr>| {
                request.response.map(|mut response| {
                    response.message.payload = b"unreliable".to_vec();
                    response
                })
            },
        )));
        tokio::spawn(async move { server.run().await });

        let client = CoapClient::new(addr).await.unwrap();
        let mut request: CoapRequest<SocketAddr> = CoapRequest::new();
        request.set_method(Method::Get);
        request.set_path("/non");
        request
            .message
            .header
            .set_type(MessageType::NonConfirmable);

        let response = client.request(request).await.unwrap();
        assert_eq!(response.message.payload, b"unreliable".to_vec());
        assert_eq!(
            response.message.header.get_type(),
            MessageType::NonConfirmable
        );
    }

    #[tokio::test]
    async fn test_peer_reset_closes_exchange() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = peer.local_addr().unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            let (nread, src) = peer.recv_from(&mut buf).await.unwrap();
            let request = Packet::from_bytes(&buf[..nread]).unwrap();
            let reset = empty_reset(request.header.message_id);
            peer.send_to(&reset.to_bytes().unwrap(), src).await.unwrap();
        });

        let client = CoapClient::new(addr).await.unwrap();
        let mut request: CoapRequest<SocketAddr> = CoapRequest::new();
        request.set_method(Method::Get);
        request.set_path("/refused");

        match client.request(request).await {
            Err(Error::PeerReset) => {}
            other => panic!(
                "expected peer reset, got {:?}",
                other.map(|r| r.message.payload)
            ),
        }
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_against_dead_peer_times_out() {
        // Aggressive timings so the full retransmission schedule fits in a
        // test run against a socket nobody answers on.
        let params = TransmissionParameters {
            ack_timeout: std::time::Duration::from_millis(10),
            ack_random_factor: 1.0,
            max_retransmit: 1,
            ..TransmissionParameters::default()
        };

        // Bind a socket to reserve an address, then never read from it.
        let dead = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = dead.local_addr().unwrap();

        let client = CoapClient::with_parameters(addr, params).await.unwrap();
        let mut request: CoapRequest<SocketAddr> = CoapRequest::new();
        request.set_method(Method::Get);
        request.set_path("/nobody");

        match client.request(request).await {
            Err(Error::ConfirmableTimeout) => {}
            other => panic!("expected timeout, got {:?}", other.map(|r| r.message.payload)),
        }
    }
}
