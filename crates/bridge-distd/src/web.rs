//! The HTTP front.
//!
//! Answers `GET /` with an HTML page of bridge lines, or bare
//! `text/plain` when `format=plain` is given.  TLS is left to a
//! reverse proxy; when the proxy is trusted, `use_forwarded_header`
//! makes us take the client address from `X-Forwarded-For` instead of
//! the socket peer.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use safelog::sensitive;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use bridge_dist::{IntervalSchedule, IpDistributor};
use bridge_hashring::{Bridge, BridgeFilter, IpFamily};

/// Everything the HTTP handlers need.
pub(crate) struct WebContext {
    /// The IP-based distributor.
    pub(crate) dist: Arc<RwLock<IpDistributor>>,
    /// The rotation schedule producing epoch strings.
    pub(crate) schedule: IntervalSchedule,
    /// Most bridges per answer.
    pub(crate) n_bridges: usize,
    /// Whether to trust `X-Forwarded-For`.
    pub(crate) use_forwarded_header: bool,
}

/// Top of the HTML answer page.
const HTML_HEAD: &str = r#"<html><body>
<p>Here are your bridge relays:</p>
<pre id="bridges">
"#;

/// Bottom of the HTML answer page.
const HTML_TAIL: &str = r#"</pre>
<p>Bridge relays (or "bridges" for short) are Tor relays that aren't
listed in the main directory. Since there is no complete public list
of them, even if your ISP is filtering connections to all known Tor
relays, it probably won't be able to block all the bridges.</p>
<p>Configuring more than one bridge address will make your Tor
connection more stable, in case some of the bridges become
unreachable.</p>
<p>You can also get bridges by emailing the bridge request address of
this deployment with the line "get bridges" by itself in the body of
the mail, from an account at one of the supported mail providers.</p>
</body></html>
"#;

/// The body served when we have nothing to answer.
pub(crate) const EMPTY_ANSWER: &str = "No bridges available.";

/// Render the answer lines for `bridges`, honouring the requested
/// transport and address family.
pub(crate) fn bridge_lines(
    bridges: &[Arc<Bridge>],
    ipv6: bool,
    transport: Option<&str>,
) -> Vec<String> {
    let family = if ipv6 { IpFamily::V6 } else { IpFamily::V4 };
    bridges
        .iter()
        .filter_map(|b| match transport {
            Some(t) => b.transport_line(t, family),
            None if ipv6 => b.bridge_line_for_family(IpFamily::V6),
            None => Some(b.bridge_line()),
        })
        .collect()
}

/// Turn the requested options into filter predicates.
pub(crate) fn request_filters(ipv6: bool, transport: Option<&str>) -> Vec<BridgeFilter> {
    let family = if ipv6 { IpFamily::V6 } else { IpFamily::V4 };
    let mut filters = Vec::new();
    if ipv6 {
        filters.push(BridgeFilter::by_family(IpFamily::V6));
    }
    if let Some(t) = transport {
        filters.push(BridgeFilter::by_transport(t, family));
    }
    filters
}

/// Split a query string into key/value pairs.  No percent-decoding:
/// every option we accept is plain ASCII.
fn query_params(query: Option<&str>) -> Vec<(String, String)> {
    query
        .unwrap_or("")
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|s| match s.split_once('=') {
            Some((k, v)) => (k.to_owned(), v.to_owned()),
            None => (s.to_owned(), String::new()),
        })
        .collect()
}

/// Decide which address to treat as the client.
///
/// With `use_forwarded` set, the last comma-separated entry of
/// `X-Forwarded-For` wins if it parses; anything else falls back to
/// the socket peer.
fn client_ip(use_forwarded: bool, forwarded: Option<&str>, peer: IpAddr) -> IpAddr {
    if !use_forwarded {
        return peer;
    }
    match forwarded.and_then(|h| h.rsplit(',').next()) {
        Some(last) => match last.trim().parse() {
            Ok(ip) => ip,
            Err(_) => {
                warn!("unparseable X-Forwarded-For entry; using socket peer");
                peer
            }
        },
        None => peer,
    }
}

/// Build a response with the given status and no body.
fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = status;
    resp
}

/// Build a 200 response with a body and content type.
fn body_response(content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(content_type),
    );
    resp
}

/// Handle one request.
fn handler(
    ctx: &WebContext,
    peer: SocketAddr,
    req: &Request<Incoming>,
) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return empty_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    let params = query_params(req.uri().query());
    let plain = params
        .iter()
        .any(|(k, v)| k == "format" && v == "plain");
    let ipv6 = params.iter().any(|(k, _)| k == "ipv6");
    let transport = params
        .iter()
        .find(|(k, _)| k == "transport")
        .map(|(_, v)| v.as_str());

    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let ip = client_ip(ctx.use_forwarded_header, forwarded, peer.ip());

    let epoch = ctx.schedule.interval_at(SystemTime::now());
    let filters = request_filters(ipv6, transport);
    let bridges = ctx
        .dist
        .read()
        .expect("poisoned lock")
        .get_bridges_for_ip(ip, &epoch, ctx.n_bridges, &filters);
    let lines = bridge_lines(&bridges, ipv6, transport);
    info!(
        "answering web client {} with {} bridges",
        sensitive(ip),
        lines.len()
    );

    let answer = if lines.is_empty() {
        EMPTY_ANSWER.to_owned()
    } else {
        lines.join("\n")
    };
    if plain {
        body_response("text/plain; charset=utf-8", answer)
    } else {
        body_response(
            "text/html; charset=utf-8",
            format!("{}{}\n{}", HTML_HEAD, answer, HTML_TAIL),
        )
    }
}

/// Serve the HTTP front on `listener`, forever.
pub(crate) async fn serve(listener: TcpListener, ctx: Arc<WebContext>) -> anyhow::Result<()> {
    // Connections are tracked in a JoinSet so that they all get
    // aborted in order if this task is dropped.
    let mut tasks: JoinSet<Result<(), hyper::Error>> = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("web connection from {}", sensitive(peer));
                    let ctx = Arc::clone(&ctx);
                    let service = service_fn(move |req| {
                        let ctx = Arc::clone(&ctx);
                        async move {
                            Ok::<_, Infallible>(handler(&ctx, peer, &req))
                        }
                    });
                    tasks.spawn(
                        http1::Builder::new().serve_connection(TokioIo::new(stream), service),
                    );
                }
                Err(e) => {
                    warn!("listener accept failure: {}", e);
                    continue;
                }
            },
            Some(finished) = tasks.join_next() => match finished {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("web connection ended with an error: {}", e),
                Err(e) => warn!("web connection task exited ungracefully: {}", e),
            },
        }
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;
    use bridge_hashring::testing::{fake_bridge, fake_dual_bridge};

    #[test]
    fn query_parsing() {
        let got = query_params(Some("format=plain&ipv6=1&transport=obfs4"));
        assert_eq!(got.len(), 3);
        assert_eq!(got[0], ("format".to_owned(), "plain".to_owned()));
        assert_eq!(got[1], ("ipv6".to_owned(), "1".to_owned()));
        assert!(query_params(None).is_empty());
        // A bare key still registers.
        assert_eq!(query_params(Some("ipv6")), vec![("ipv6".to_owned(), String::new())]);
    }

    #[test]
    fn forwarded_header_parsing() {
        let peer: IpAddr = "198.51.100.1".parse().unwrap();

        // Disabled: the header is ignored entirely.
        assert_eq!(client_ip(false, Some("192.0.2.9"), peer), peer);

        // Enabled: last entry wins.
        assert_eq!(
            client_ip(true, Some("203.0.113.50, 192.0.2.9"), peer),
            "192.0.2.9".parse::<IpAddr>().unwrap()
        );
        // Junk falls back to the peer.
        assert_eq!(client_ip(true, Some("not-an-ip"), peer), peer);
        assert_eq!(client_ip(true, None, peer), peer);
    }

    #[test]
    fn line_rendering() {
        let v4 = Arc::new(fake_bridge(1));
        let dual = {
            let mut b = fake_dual_bridge(2);
            b.transports.push(bridge_hashring::Transport {
                method: "obfs4".to_owned(),
                addr: "192.0.2.5:9443".parse().unwrap(),
                params: vec![("cert".to_owned(), "abcd".to_owned())],
            });
            Arc::new(b)
        };
        let bridges = vec![v4, dual];

        let vanilla = bridge_lines(&bridges, false, None);
        assert_eq!(vanilla.len(), 2);

        // Only the dual-stack bridge can answer an ipv6 request.
        let v6 = bridge_lines(&bridges, true, None);
        assert_eq!(v6.len(), 1);
        assert!(v6[0].starts_with('['));

        let obfs = bridge_lines(&bridges, false, Some("obfs4"));
        assert_eq!(obfs.len(), 1);
        assert!(obfs[0].starts_with("obfs4 192.0.2.5:9443"));
        assert!(obfs[0].ends_with("cert=abcd"));
    }

    #[test]
    fn filters_for_request() {
        assert!(request_filters(false, None).is_empty());
        assert_eq!(request_filters(true, None).len(), 1);
        assert_eq!(request_filters(true, Some("obfs4")).len(), 2);
    }
}
