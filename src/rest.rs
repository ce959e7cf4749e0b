//! The signing endpoint exposed when the signer runs as its own process:
//! the observer POSTs codec-encoded signing requests and gets a JSON verdict
//! back.

use crate::{chain::SourceChain, codec::SigningRequest, signer::Signer};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use std::{io::Read, net::SocketAddr, sync::Arc};

pub const ACTION_SIGN_TX: &str = "signtx";
pub const DESC_SUCCESS: &str = "SUCCESS";

pub const ERR_OK: u32 = 0;
pub const ERR_BAD_REQUEST: u32 = 1;
pub const ERR_SIGN_FAILED: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
pub struct SignTxRequest {
    /// Hex of a codec-encoded signing request.
    pub raw: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub action: String,
    pub error: u32,
    pub desc: String,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug)]
pub struct RestError(pub String);

impl std::fmt::Display for RestError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Rest error: {}", self.0)
    }
}

impl std::error::Error for RestError {}

/// Accept signing requests until process shutdown. We expect a single
/// observer to call in once in a while, there is *no need* for complexity
/// here so just treat incoming requests sequentially.
pub fn serve<C: SourceChain>(listen: SocketAddr, signer: Arc<Signer<C>>) -> Result<(), RestError> {
    let server = tiny_http::Server::http(listen)
        .map_err(|e| RestError(format!("binding on '{}': '{}'", listen, e)))?;
    log::info!("signing endpoint listening on {}", listen);

    for mut http_request in server.incoming_requests() {
        log::trace!(
            "got a new request: {} {}",
            http_request.method(),
            http_request.url()
        );

        if http_request.method() != &tiny_http::Method::Post
            || http_request.url() != "/api/v1/signtx"
        {
            respond(
                http_request,
                failure(ERR_BAD_REQUEST, "unknown endpoint".to_string()),
            );
            continue;
        }

        let mut body = String::new();
        if let Err(e) = http_request.as_reader().read_to_string(&mut body) {
            log::error!("reading request body: '{}'", e);
            continue;
        }

        let response = handle_sign_tx(&signer, &body);
        respond(http_request, response);
    }

    Ok(())
}

/// Decode and execute one signing call. Malformed bodies get an error
/// response; they are never fatal and never retried.
pub fn handle_sign_tx<C: SourceChain>(signer: &Signer<C>, body: &str) -> Response {
    let request: SignTxRequest = match serde_json::from_str(body) {
        Ok(request) => request,
        Err(e) => return failure(ERR_BAD_REQUEST, format!("decoding request: {}", e)),
    };
    let raw = match hex::decode(&request.raw) {
        Ok(raw) => raw,
        Err(e) => return failure(ERR_BAD_REQUEST, format!("bad hex: {}", e)),
    };
    let item = match SigningRequest::decode(&raw) {
        Ok(item) => item,
        Err(e) => return failure(ERR_BAD_REQUEST, format!("decoding signing request: {}", e)),
    };

    match signer.sign(item) {
        Ok(()) => Response {
            action: ACTION_SIGN_TX.to_string(),
            error: ERR_OK,
            desc: DESC_SUCCESS.to_string(),
            result: Value::Null,
        },
        Err(e) => failure(ERR_SIGN_FAILED, e.to_string()),
    }
}

fn failure(error: u32, desc: String) -> Response {
    Response {
        action: ACTION_SIGN_TX.to_string(),
        error,
        desc,
        result: Value::Null,
    }
}

fn respond(http_request: tiny_http::Request, response: Response) {
    let body = match serde_json::to_string(&response) {
        Ok(body) => body,
        Err(e) => {
            log::error!("serializing response: '{}'", e);
            return;
        }
    };
    let header = tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
        .expect("static header is well-formed");
    if let Err(e) = http_request.respond(tiny_http::Response::from_string(body).with_header(header))
    {
        log::error!("writing response: '{}'", e);
    }
}
