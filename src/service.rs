use coap_lite::{CoapOption, CoapRequest, CoapResponse, Packet, RequestType, ResponseType};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::error::Error;
use crate::params::TransmissionParameters;

const MAX_AGE_DEFAULT: u32 = 60;

/// One-shot promise a webservice must fulfill with its response.
///
/// Producing a response is mandatory; a dropped promise counts as a
/// handler failure and the peer gets 5.03 Service Unavailable.
pub struct ResponsePromise {
    tx: oneshot::Sender<Result<CoapResponse, Error>>,
}

impl ResponsePromise {
    fn channel() -> (ResponsePromise, oneshot::Receiver<Result<CoapResponse, Error>>) {
        let (tx, rx) = oneshot::channel();
        (ResponsePromise { tx }, rx)
    }

    /// Completes the exchange with `response`.
    pub fn resolve(self, response: CoapResponse) {
        let _ = self.tx.send(Ok(response));
    }

    /// Completes the exchange with a handler failure, reported to the peer
    /// as 5.00 Internal Server Error.
    pub fn fail(self, reason: impl Into<String>) {
        let _ = self.tx.send(Err(Error::HandlerFailed(reason.into())));
    }
}

/// The contract a registered resource implements.
///
/// `handle` is invoked once per fresh request; duplicates are answered from
/// the reliability layer's response cache and never reach the service. The
/// service may fulfill the promise synchronously or move it into a task of
/// its own.
pub trait Webservice: Send + Sync {
    /// Absolute path the service is reachable at, e.g. `/sensors/temp`.
    fn path(&self) -> &str;

    /// Freshness lifetime of a response representation, in seconds.
    fn max_age(&self) -> u32 {
        MAX_AGE_DEFAULT
    }

    /// Version tag over the current resource state (not the payload).
    fn etag(&self) -> Option<Vec<u8>> {
        None
    }

    /// Whether DELETE requests reach `handle` at all.
    fn allows_delete(&self) -> bool {
        false
    }

    /// Processes `request` from `remote` and eventually fulfills `promise`.
    fn handle(&self, request: CoapRequest<SocketAddr>, remote: SocketAddr, promise: ResponsePromise);

    /// Called once when the service is unregistered.
    fn shutdown(&self) {}
}

// Two resources are the same resource iff they live at the same path.
impl PartialEq for dyn Webservice {
    fn eq(&self, other: &Self) -> bool {
        self.path() == other.path()
    }
}

impl Eq for dyn Webservice {}

impl Hash for dyn Webservice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path().hash(state);
    }
}

/// Adapts a plain closure into a [`Webservice`] at a fixed path.
///
/// Returning `None` from the closure counts as a handler failure.
pub struct FnService<F> {
    path: String,
    handler: F,
}

impl<F> FnService<F>
where
    F: Fn(CoapRequest<SocketAddr>) -> Option<CoapResponse> + Send + Sync,
{
    pub fn new(path: impl Into<String>, handler: F) -> FnService<F> {
        FnService {
            path: path.into(),
            handler,
        }
    }
}

impl<F> Webservice for FnService<F>
where
    F: Fn(CoapRequest<SocketAddr>) -> Option<CoapResponse> + Send + Sync,
{
    fn path(&self) -> &str {
        &self.path
    }

    fn handle(&self, request: CoapRequest<SocketAddr>, _remote: SocketAddr, promise: ResponsePromise) {
        match (self.handler)(request) {
            Some(response) => promise.resolve(response),
            None => promise.fail("service produced no response"),
        }
    }
}

/// Routes decoded requests to registered webservices and turns their
/// promises into responses for the reliability layer.
pub struct Dispatcher {
    params: TransmissionParameters,
    services: Mutex<HashMap<String, Arc<dyn Webservice>>>,
}

impl Dispatcher {
    pub fn new(params: TransmissionParameters) -> Dispatcher {
        Dispatcher {
            params,
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `service` at its path, replacing (and shutting down) any
    /// service previously registered there.
    pub fn register(&self, service: Arc<dyn Webservice>) {
        let path = service.path().to_string();
        info!("registered service at {}", path);
        let replaced = self.services.lock().unwrap().insert(path, service);
        if let Some(old) = replaced {
            old.shutdown();
        }
    }

    /// Unregisters the service at `path` and calls its shutdown hook.
    pub fn unregister(&self, path: &str) -> bool {
        let removed = self.services.lock().unwrap().remove(path);
        match removed {
            Some(service) => {
                info!("unregistered service at {}", path);
                service.shutdown();
                true
            }
            None => false,
        }
    }

    /// Routes `request` and resolves to the response to transmit, or None
    /// when the message cannot carry one.
    pub async fn dispatch(&self, request: CoapRequest<SocketAddr>) -> Option<CoapResponse> {
        let reply = request.response.clone()?;
        let token = request.message.get_token().to_vec();

        if let Some(number) = unknown_critical_option(&request.message) {
            debug!("request carries unknown critical option {}", number);
            return Some(error_response(reply, ResponseType::BadOption, token));
        }

        let path = request.get_path();
        let service = match self.find(&path) {
            Some(service) => service,
            None => {
                debug!("no service registered at /{}", path);
                return Some(error_response(reply, ResponseType::NotFound, token));
            }
        };

        if !method_allowed(request.get_method(), service.as_ref()) {
            return Some(error_response(reply, ResponseType::MethodNotAllowed, token));
        }

        let remote = request.source?;
        let (promise, rx) = ResponsePromise::channel();
        service.handle(request, remote, promise);

        let response = match timeout(self.params.max_transmit_span(), rx).await {
            Ok(Ok(Ok(response))) => decorate(response, service.as_ref()),
            Ok(Ok(Err(error))) => {
                warn!("service /{} failed: {}", path, error);
                error_response(reply, ResponseType::InternalServerError, token.clone())
            }
            Ok(Err(_dropped)) => {
                warn!("service /{} dropped its response promise", path);
                error_response(reply, ResponseType::ServiceUnavailable, token.clone())
            }
            Err(_elapsed) => {
                warn!("service /{} missed the transmit span deadline", path);
                error_response(reply, ResponseType::ServiceUnavailable, token.clone())
            }
        };

        // The response must always echo the request token.
        let mut response = response;
        response.message.set_token(token);
        Some(response)
    }

    fn find(&self, path: &str) -> Option<Arc<dyn Webservice>> {
        let services = self.services.lock().unwrap();
        services
            .get(path)
            .or_else(|| services.get(&format!("/{}", path)))
            .cloned()
    }

    /// Shuts down and drops every registered service.
    pub fn shutdown(&self) {
        let services = std::mem::take(&mut *self.services.lock().unwrap());
        for service in services.into_values() {
            service.shutdown();
        }
    }
}

fn method_allowed(method: &RequestType, service: &dyn Webservice) -> bool {
    match method {
        RequestType::Get | RequestType::Post | RequestType::Put => true,
        RequestType::Delete => service.allows_delete(),
        _ => false,
    }
}

fn error_response(mut reply: CoapResponse, status: ResponseType, token: Vec<u8>) -> CoapResponse {
    reply.set_status(status);
    reply.message.payload = Vec::new();
    reply.message.set_token(token);
    reply
}

/// Fills in Max-Age and ETag from the service on successful responses,
/// unless the service set them itself.
fn decorate(mut response: CoapResponse, service: &dyn Webservice) -> CoapResponse {
    let success = matches!(
        response.get_status(),
        ResponseType::Created
            | ResponseType::Deleted
            | ResponseType::Valid
            | ResponseType::Changed
            | ResponseType::Content
    );
    if !success {
        return response;
    }

    if response.message.get_option(CoapOption::MaxAge).is_none() {
        response
            .message
            .add_option(CoapOption::MaxAge, encode_uint(service.max_age()));
    }
    if response.message.get_option(CoapOption::ETag).is_none() {
        if let Some(etag) = service.etag() {
            response.message.add_option(CoapOption::ETag, etag);
        }
    }
    response
}

/// Scans the request options for a critical option the runtime does not
/// recognize. Option numbers with the low bit set are critical and must be
/// understood, per RFC 7252 section 5.4.1.
fn unknown_critical_option(message: &Packet) -> Option<usize> {
    message.options().find_map(|(number, _)| {
        let number = usize::from(*number);
        let critical = number & 1 == 1;
        if critical && !recognized_option(number) {
            Some(number)
        } else {
            None
        }
    })
}

fn recognized_option(number: usize) -> bool {
    matches!(
        number,
        1 | 3 | 4 | 5 | 6 | 7 | 8 | 11 | 12 | 14 | 15 | 17 | 20 | 23 | 27 | 28 | 35 | 39 | 60 | 258
    )
}

fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|byte| **byte == 0).count();
    bytes[skip..].to_vec()
}
