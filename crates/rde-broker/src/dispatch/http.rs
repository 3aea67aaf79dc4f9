//! HTTP reverse proxy over agent streams
//!
//! Every proxied request gets its own stream and an HTTP/1.1 client
//! connection on top of it. Protocol upgrades (WebSockets to a workload's
//! web IDE, for instance) are spliced once both sides switched protocols.

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{relay, Dispatcher, RelayOptions, RelayStats};
use crate::error::DispatchError;
use crate::registry::AgentSession;

/// Hop-by-hop headers, never forwarded as-is
const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

fn is_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
    if keep_upgrade {
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    } else {
        headers.remove(header::UPGRADE);
    }
}

/// Replace the request path, keeping the query
pub fn rewrite_path(uri: &Uri, path: &str) -> Result<Uri, axum::http::Error> {
    let path_and_query = match uri.query() {
        Some(query) => format!("/{}?{}", path.trim_start_matches('/'), query),
        None => format!("/{}", path.trim_start_matches('/')),
    };
    Ok(Uri::builder().path_and_query(path_and_query).build()?)
}

/// Relay a switched-protocols connection under the same timeouts as any
/// other stream
async fn splice<C, A>(
    client: C,
    agent: A,
    cancel: &CancellationToken,
    options: &RelayOptions,
) -> io::Result<RelayStats>
where
    C: AsyncRead + AsyncWrite,
    A: AsyncRead + AsyncWrite,
{
    let (client_read, client_write) = tokio::io::split(client);
    relay(client_read, client_write, agent, cancel, options).await
}

/// Forward `request` to the agent of `session`
pub async fn forward(
    dispatcher: &Dispatcher,
    session: Arc<AgentSession>,
    mut request: Request<Body>,
) -> Result<Response<Body>, DispatchError> {
    let stream = dispatcher.open(&session).await?;
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

    let agent_id = session.agent_id().clone();
    let cancel = session.cancellation_token().child_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            result = connection.with_upgrades() => {
                if let Err(e) = result {
                    debug!(agent_id = %agent_id, "Proxied HTTP connection ended: {}", e);
                }
            }
        }
    });

    let upgrade = is_upgrade(request.headers());
    let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut request));
    strip_hop_by_hop(request.headers_mut(), upgrade);

    let mut response = sender.send_request(request).await?;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(client_upgrade) = client_upgrade {
            let agent_upgrade = hyper::upgrade::on(&mut response);
            let agent_id = session.agent_id().clone();
            let cancel = session.cancellation_token().child_token();
            let options = dispatcher.relay.clone();
            tokio::spawn(async move {
                match tokio::try_join!(client_upgrade, agent_upgrade) {
                    Ok((client, agent)) => {
                        match splice(TokioIo::new(client), TokioIo::new(agent), &cancel, &options).await {
                            Ok(stats) => debug!(
                                agent_id = %agent_id,
                                to_agent = stats.to_agent,
                                from_agent = stats.from_agent,
                                "Upgraded connection finished"
                            ),
                            Err(e) => debug!(agent_id = %agent_id, "Upgraded connection ended: {}", e),
                        }
                    }
                    Err(e) => warn!(agent_id = %agent_id, "Protocol upgrade failed: {}", e),
                }
            });
        }
    } else {
        strip_hop_by_hop(response.headers_mut(), false);
    }

    Ok(response.map(Body::new))
}
