use coap_lite::Packet;
use log::{debug, error, info};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::mpsc;

use crate::params::TransmissionParameters;
use crate::reliability::exchange::ExchangeRegistry;
use crate::reliability::incoming::{InboundEvent, IncomingReliabilityHandler};
use crate::reliability::message_id::MessageIdFactory;
use crate::reliability::outgoing::OutgoingReliabilityHandler;
use crate::reliability::retransmission::RetransmissionScheduler;
use crate::service::{Dispatcher, Webservice};

/// Channel end used by timers and handlers to queue packets for the socket.
/// The reactor owns the socket; nothing else writes to it directly.
pub type MessageSender = mpsc::UnboundedSender<(Packet, SocketAddr)>;
pub(crate) type MessageReceiver = mpsc::UnboundedReceiver<(Packet, SocketAddr)>;

pub(crate) const MAX_DATAGRAM_SIZE: usize = 1500;

/// A CoAP server: one UDP socket, the reliability core around it and a
/// registry of webservices behind it.
///
/// The reactor loop in [`run`](Server::run) serializes all socket reads and
/// writes. Request handling happens in spawned tasks; their responses and
/// every timer-driven packet (empty ACKs, retransmissions, resets) come
/// back through the outbound queue.
pub struct Server {
    socket: UdpSocket,
    tx: MessageSender,
    rx: MessageReceiver,
    incoming: IncomingReliabilityHandler,
    outgoing: Arc<OutgoingReliabilityHandler>,
    dispatcher: Arc<Dispatcher>,
    exchanges: Arc<ExchangeRegistry>,
}

impl Server {
    /// Creates a CoAP server listening on the given address with RFC 7252
    /// default transmission parameters.
    pub async fn new<A: ToSocketAddrs>(addr: A) -> io::Result<Server> {
        Self::with_parameters(addr, TransmissionParameters::default()).await
    }

    pub async fn with_parameters<A: ToSocketAddrs>(
        addr: A,
        params: TransmissionParameters,
    ) -> io::Result<Server> {
        let socket = UdpSocket::bind(addr).await?;
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
        let dispatcher = Arc::new(Dispatcher::new(params));

        Ok(Server {
            socket,
            tx,
            rx,
            incoming,
            outgoing,
            dispatcher,
            exchanges,
        })
    }

    /// The address the server socket is bound to.
    pub fn socket_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Registers `service` at its path.
    pub fn register(&self, service: Arc<dyn Webservice>) {
        self.dispatcher.register(service);
    }

    /// Unregisters the service at `path`, invoking its shutdown hook.
    pub fn unregister(&self, path: &str) -> bool {
        self.dispatcher.unregister(path)
    }

    /// A sender into the outbound queue, for callers that need to inject
    /// packets into the reactor.
    pub fn message_sender(&self) -> MessageSender {
        self.tx.clone()
    }

    /// Runs the reactor until a socket error occurs.
    pub async fn run(&mut self) -> io::Result<()> {
        info!("server up on {}", self.socket.local_addr()?);
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (nread, src) = received?;
                    match Packet::from_bytes(&buf[..nread]) {
                        Ok(message) => self.handle_inbound(message, src),
                        Err(_) => debug!("dropping unparseable datagram from {}", src),
                    }
                }
                queued = self.rx.recv() => {
                    // The reactor holds a sender, so the queue never closes.
                    if let Some((message, dst)) = queued {
                        self.transmit(message, dst).await?;
                    }
                }
            }
        }
    }

    fn handle_inbound(&self, message: Packet, src: SocketAddr) {
        match self.incoming.handle(message, src) {
            InboundEvent::Request(request) => {
                let request_mid = request.message.header.message_id;
                let dispatcher = Arc::clone(&self.dispatcher);
                let outgoing = Arc::clone(&self.outgoing);
                tokio::spawn(async move {
                    if let Some(response) = dispatcher.dispatch(request).await {
                        if let Err(error) = outgoing.send_response(src, request_mid, response) {
                            error!("failed to send response to {}: {}", src, error);
                        }
                    }
                });
            }
            InboundEvent::Response(message) => {
                // A separate response to a request this endpoint sent out.
                let token = message.get_token().to_vec();
                if !self.exchanges.resolve_waiter(src, &token, message) {
                    debug!("no request waiting for token {:?} from {}", token, src);
                }
            }
            InboundEvent::Acknowledgement {
                message_id,
                response,
            } => {
                self.outgoing.acknowledged(src, message_id, response);
            }
            InboundEvent::Reset { message_id } => {
                self.outgoing.reset_received(src, message_id);
            }
            InboundEvent::Handled => {}
        }
    }

    async fn transmit(&self, message: Packet, dst: SocketAddr) -> io::Result<()> {
        match message.to_bytes() {
            Ok(bytes) => {
                self.socket.send_to(&bytes[..], dst).await?;
            }
            Err(error) => error!("failed to encode outbound message: {:?}", error),
        }
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.dispatcher.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::CoapClient;
    use crate::service::{FnService, ResponsePromise};
    use coap_lite::{
        CoapRequest, CoapResponse, MessageClass, MessageType, RequestType, ResponseType,
    };
    use std::time::Duration;

    async fn spawn_server<F>(services: F) -> SocketAddr
    where
        F: FnOnce(&Server),
    {
        let mut server = Server::new("127.0.0.1:0").await.unwrap();
        let addr = server.socket_addr().unwrap();
        services(&server);
        tokio::spawn(async move { server.run().await });
        addr
    }

    fn echo_path_service() -> Arc<dyn Webservice> {
        Arc::new(FnService::new(
            "/test-echo",
            |request: CoapRequest<SocketAddr>| {
                let uri_path = request.get_path();
                request.response.map(|mut response: CoapResponse| {
                    response.message.payload = uri_path.into_bytes();
                    response
                })
            },
        ))
    }

    #[tokio::test]
    async fn test_echo_server_piggybacked() {
        let addr = spawn_server(|server| server.register(echo_path_service())).await;

        let client = CoapClient::new(addr).await.unwrap();
        let mut request: CoapRequest<SocketAddr> = CoapRequest::new();
        request.set_method(RequestType::Get);
        request.set_path("/test-echo");
        request.message.set_token(vec![0x51, 0x55, 0x77, 0xe8]);

        let response = client.request(request).await.unwrap();
        assert_eq!(response.message.payload, b"test-echo".to_vec());
        assert_eq!(
            response.message.header.get_type(),
            MessageType::Acknowledgement
        );
        assert_eq!(
            response.message.get_token().to_vec(),
            vec![0x51, 0x55, 0x77, 0xe8]
        );
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let addr = spawn_server(|server| server.register(echo_path_service())).await;

        let client = CoapClient::new(addr).await.unwrap();
        let mut request: CoapRequest<SocketAddr> = CoapRequest::new();
        request.set_method(RequestType::Get);
        request.set_path("/missing");

        let response = client.request(request).await.unwrap();
        assert_eq!(*response.get_status(), ResponseType::NotFound);
    }

    #[tokio::test]
    async fn test_slow_service_gets_separate_response() {
        struct SlowService;
        impl Webservice for SlowService {
            fn path(&self) -> &str {
                "/slow"
            }
            fn handle(
                &self,
                request: CoapRequest<SocketAddr>,
                _remote: SocketAddr,
                promise: ResponsePromise,
            ) {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    match request.response {
                        Some(mut response) => {
                            response.message.payload = b"eventually".to_vec();
                            promise.resolve(response);
                        }
                        None => promise.fail("no response slot"),
                    }
                });
            }
        }

        // An ACK delay far below the service latency forces the separate
        // response path without slowing the test down.
        let params = TransmissionParameters {
            ack_delay: Duration::from_millis(20),
            ..TransmissionParameters::default()
        };
        let mut server = Server::with_parameters("127.0.0.1:0", params.clone())
            .await
            .unwrap();
        let addr = server.socket_addr().unwrap();
        server.register(Arc::new(SlowService));
        tokio::spawn(async move { server.run().await });

        let client = CoapClient::with_parameters(addr, params).await.unwrap();
        let mut request: CoapRequest<SocketAddr> = CoapRequest::new();
        request.set_method(RequestType::Get);
        request.set_path("/slow");

        let response = client.request(request).await.unwrap();
        assert_eq!(response.message.payload, b"eventually".to_vec());
        // The separate response arrives as its own confirmable.
        assert_eq!(response.message.header.get_type(), MessageType::Confirmable);
    }

    #[tokio::test]
    async fn test_ping_gets_reset() {
        let addr = spawn_server(|_| {}).await;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut ping = Packet::new();
        ping.header.set_version(1);
        ping.header.set_type(MessageType::Confirmable);
        ping.header.code = MessageClass::Empty;
        ping.header.message_id = 0x7001;
        socket
            .send_to(&ping.to_bytes().unwrap(), addr)
            .await
            .unwrap();

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (nread, _) = socket.recv_from(&mut buf).await.unwrap();
        let reset = Packet::from_bytes(&buf[..nread]).unwrap();
        assert_eq!(reset.header.get_type(), MessageType::Reset);
        assert_eq!(reset.header.message_id, 0x7001);
    }

    #[tokio::test]
    async fn test_duplicate_request_invokes_service_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let invocations = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&invocations);
        let addr = spawn_server(move |server| {
            server.register(Arc::new(FnService::new(
                "/counter",
                move |request: CoapRequest<SocketAddr>| {
                    counted.fetch_add(1, Ordering::SeqCst);
                    request.response.map(|mut response: CoapResponse| {
                        response.message.payload = b"23".to_vec();
                        response
                    })
                },
            )));
        })
        .await;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut request: CoapRequest<SocketAddr> = CoapRequest::new();
        request.set_method(RequestType::Get);
        request.set_path("/counter");
        request.message.header.set_type(MessageType::Confirmable);
        request.message.header.message_id = 0x1001;
        request.message.set_token(vec![0xab]);
        let bytes = request.message.to_bytes().unwrap();

        // The same datagram twice: the duplicate is answered from the
        // response cache.
        socket.send_to(&bytes, addr).await.unwrap();
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (nread, _) = socket.recv_from(&mut buf).await.unwrap();
        let first = Packet::from_bytes(&buf[..nread]).unwrap();
        assert_eq!(first.payload, b"23".to_vec());

        socket.send_to(&bytes, addr).await.unwrap();
        let (nread, _) = socket.recv_from(&mut buf).await.unwrap();
        let second = Packet::from_bytes(&buf[..nread]).unwrap();
        assert_eq!(second.payload, b"23".to_vec());
        assert_eq!(second.header.message_id, 0x1001);

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }
}
