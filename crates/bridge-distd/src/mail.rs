//! The email front.
//!
//! A deliberately small SMTP server: it accepts mail for one local
//! part, reads one message, and maybe sends one reply through the
//! configured smarthost.  Anything surprising (wrong recipient,
//! oversized body, no `get bridges` line, unsupported sender domain)
//! ends with no reply at all; an autoresponder that answers strangers
//! is a spam cannon.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use safelog::sensitive;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use bridge_dist::{DomainRule, EmailDistributor, Error, IntervalSchedule};

use crate::web::{bridge_lines, request_filters};

/// Reject message bodies larger than this.
const MAX_MESSAGE_SIZE: usize = 32 * 1024;

/// Everything the mail handlers need.
pub(crate) struct MailContext {
    /// The email-based distributor.
    pub(crate) dist: Arc<RwLock<EmailDistributor>>,
    /// The rotation schedule producing epoch strings.
    pub(crate) schedule: IntervalSchedule,
    /// Most bridges per answer.
    pub(crate) n_bridges: usize,
    /// The local part we accept mail for.
    pub(crate) local_part: String,
    /// `From:` header of our replies.
    pub(crate) from_addr: String,
    /// Envelope sender of our replies.
    pub(crate) smtp_from_addr: String,
    /// Smarthost relaying our replies.
    pub(crate) smarthost: SocketAddr,
}

/// Body of an answer carrying bridge lines.
const ANSWER_TEMPLATE: &str = "\
[This is an automated reply; please do not respond.]

Here are your bridge relays:

%LINES%

Bridge relays (or \"bridges\" for short) are Tor relays that aren't
listed in the main directory.  Since there is no complete public list
of them, even if your ISP is filtering connections to all known Tor
relays, it probably won't be able to block all the bridges.

Add each line to your Tor client's bridge configuration.  Configuring
more than one bridge will make your connection more stable, in case
some of the bridges become unreachable.  The answer to this address
changes every few days, so ask again when you need more.
";

/// Body of the one-shot rate-limit warning.
const WARNING_TEMPLATE: &str = "\
[This is an automated reply; please do not respond.]

You have already requested bridges recently.  Please wait %MINUTES%
minutes before asking again; requests arriving before then are
silently ignored.
";

/// What one incoming message asked of us.
#[derive(Debug, Default, PartialEq, Eq)]
struct MailRequest {
    /// Whom to answer: `Sender` header, else `From`, else the
    /// envelope sender.
    sender: Option<String>,
    /// The subject, for the `Re:` line of the reply.
    subject: Option<String>,
    /// The Message-ID, preserved as `In-Reply-To`.
    message_id: Option<String>,
    /// The first `X-DKIM-Authentication-Results` header, injected by
    /// the ingress mail filter.
    dkim: Option<String>,
    /// Whether a `get bridges` line (or subject) was present.
    wants_bridges: bool,
    /// Whether an `ipv6` line asked for v6 bridges.
    wants_ipv6: bool,
    /// The transport named by a `transport <name>` line, if any.
    transport: Option<String>,
}

/// Pull the addr-spec out of a header value like `Maria <m@x.org>`.
fn extract_addr(value: &str) -> Option<String> {
    let addr = match (value.find('<'), value.rfind('>')) {
        (Some(lt), Some(gt)) if lt < gt => &value[lt + 1..gt],
        _ => value,
    };
    let addr = addr.trim();
    if addr.is_empty() {
        None
    } else {
        Some(addr.to_owned())
    }
}

/// Parse an incoming message into a [`MailRequest`].
fn parse_message(lines: &[String], envelope_from: Option<&str>) -> MailRequest {
    let mut req = MailRequest::default();
    let mut from_header: Option<String> = None;
    let mut sender_header: Option<String> = None;

    let mut in_body = false;
    for line in lines {
        if !in_body {
            if line.trim().is_empty() {
                in_body = true;
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match name.to_ascii_lowercase().as_str() {
                "from" => from_header = from_header.or_else(|| extract_addr(value)),
                "sender" => sender_header = sender_header.or_else(|| extract_addr(value)),
                "subject" => {
                    if req.subject.is_none() {
                        req.subject = Some(value.to_owned());
                        if value.trim().eq_ignore_ascii_case("get bridges") {
                            req.wants_bridges = true;
                        }
                    }
                }
                "message-id" => {
                    if req.message_id.is_none() {
                        req.message_id = Some(value.to_owned());
                    }
                }
                // The ingress filter injects this header; we must use
                // the first one, since a client could append its own.
                "x-dkim-authentication-results" => {
                    if req.dkim.is_none() {
                        req.dkim = Some(value.to_owned());
                    }
                }
                _ => {}
            }
        } else {
            let line = line.trim().to_ascii_lowercase();
            match line.as_str() {
                "get bridges" => req.wants_bridges = true,
                "ipv6" | "get ipv6" => req.wants_ipv6 = true,
                _ => {
                    if let Some(name) = line
                        .strip_prefix("get transport ")
                        .or_else(|| line.strip_prefix("transport "))
                    {
                        let name = name.trim();
                        if !name.is_empty() {
                            req.transport = Some(name.to_owned());
                        }
                    }
                }
            }
        }
    }

    req.sender = sender_header
        .or(from_header)
        .or_else(|| envelope_from.and_then(extract_addr));
    req
}

/// Decide how to answer `req`: `Some((recipient, body))` to reply,
/// `None` to stay silent.
fn decide(ctx: &MailContext, req: &MailRequest) -> Option<(String, String)> {
    let raw_sender = req.sender.as_deref()?;
    if !req.wants_bridges {
        debug!("message carries no bridge request; dropping");
        return None;
    }

    let dist = ctx.dist.read().expect("poisoned lock");
    let client = match dist.normalize(raw_sender) {
        Ok(client) => client,
        Err(e) => {
            info!("not answering {}: {}", sensitive(raw_sender), e);
            return None;
        }
    };
    if dist.rules_for(client.domain()).contains(&DomainRule::Dkim) {
        let passed = req
            .dkim
            .as_deref()
            .map(|v| v.starts_with("pass"))
            .unwrap_or(false);
        if !passed {
            info!("bad dkim result on mail from {}; dropping", sensitive(&client));
            return None;
        }
    }

    let now = SystemTime::now();
    let epoch = ctx.schedule.interval_at(now);
    let filters = request_filters(req.wants_ipv6, req.transport.as_deref());
    match dist.get_bridges(&client, &epoch, ctx.n_bridges, &filters, now) {
        Ok(bridges) => {
            let lines = bridge_lines(&bridges, req.wants_ipv6, req.transport.as_deref());
            let body = if lines.is_empty() {
                "(no bridges currently available)".to_owned()
            } else {
                lines
                    .iter()
                    .map(|l| format!("  {}", l))
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            Some((
                raw_sender.to_owned(),
                ANSWER_TEMPLATE.replace("%LINES%", &body),
            ))
        }
        Err(Error::TooSoon { retry_in }) => {
            info!("warning {} about the rate limit", sensitive(&client));
            let minutes = retry_in.div_ceil(60).max(1);
            Some((
                raw_sender.to_owned(),
                WARNING_TEMPLATE.replace("%MINUTES%", &minutes.to_string()),
            ))
        }
        Err(Error::Ignored) => {
            debug!("silently ignoring warned sender {}", sensitive(&client));
            None
        }
        Err(e) => {
            warn!("failed to answer {}: {}", sensitive(&client), e);
            None
        }
    }
}

/// Assemble the full reply message.
fn compose_reply(ctx: &MailContext, req: &MailRequest, to: &str, body: &str) -> String {
    let subject = match req.subject.as_deref() {
        Some(s) if s.starts_with("Re:") => s.to_owned(),
        Some(s) => format!("Re: {}", s),
        None => "Re: [no subject]".to_owned(),
    };
    let mut msg = String::new();
    msg.push_str(&format!("From: {}\r\n", ctx.from_addr));
    msg.push_str(&format!("To: {}\r\n", to));
    msg.push_str(&format!("Subject: {}\r\n", subject));
    if let Some(id) = &req.message_id {
        msg.push_str(&format!("In-Reply-To: {}\r\n", id));
    }
    msg.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    msg.push_str("\r\n");
    for line in body.lines() {
        msg.push_str(line);
        msg.push_str("\r\n");
    }
    msg
}

/// Read one SMTP reply from `reader`, returning its code.
async fn read_reply(reader: &mut BufReader<OwnedReadHalf>) -> anyhow::Result<u16> {
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            anyhow::bail!("smarthost closed the connection");
        }
        let reply = line.trim_end();
        if reply.len() < 3 {
            anyhow::bail!("malformed smarthost reply");
        }
        // "250-..." marks a continuation line; anything else ends the
        // reply.
        if reply.len() == 3 || reply.as_bytes()[3] != b'-' {
            return Ok(reply[..3].parse()?);
        }
    }
}

/// Send one SMTP command and require a reply code below `max`.
async fn command(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    cmd: &str,
    max: u16,
) -> anyhow::Result<()> {
    writer.write_all(cmd.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    let code = read_reply(reader).await?;
    if code >= max {
        anyhow::bail!("smarthost refused {:?}: {}", cmd.split(':').next(), code);
    }
    Ok(())
}

/// Deliver `message` to `rcpt` through the smarthost.
async fn send_mail(ctx: &MailContext, rcpt: &str, message: &str) -> anyhow::Result<()> {
    let stream = TcpStream::connect(ctx.smarthost).await?;
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    if read_reply(&mut reader).await? >= 400 {
        anyhow::bail!("smarthost did not greet us");
    }
    command(&mut reader, &mut writer, "HELO bridge-distd", 400).await?;
    command(
        &mut reader,
        &mut writer,
        &format!("MAIL FROM:<{}>", ctx.smtp_from_addr),
        400,
    )
    .await?;
    command(&mut reader, &mut writer, &format!("RCPT TO:<{}>", rcpt), 400).await?;
    command(&mut reader, &mut writer, "DATA", 400).await?;
    for line in message.split("\r\n") {
        // Dot-stuffing, so a body line of "." cannot end the message.
        if line.starts_with('.') {
            writer.write_all(b".").await?;
        }
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }
    command(&mut reader, &mut writer, ".", 400).await?;
    command(&mut reader, &mut writer, "QUIT", 600).await?;
    Ok(())
}

/// Handle one message: parse, decide, maybe reply.
async fn process_message(ctx: &MailContext, envelope_from: Option<String>, lines: Vec<String>) {
    let req = parse_message(&lines, envelope_from.as_deref());
    let Some((rcpt, body)) = decide(ctx, &req) else {
        return;
    };
    let message = compose_reply(ctx, &req, &rcpt, &body);
    match send_mail(ctx, &rcpt, &message).await {
        Ok(()) => info!("sent reply to {}", sensitive(&rcpt)),
        Err(e) => warn!("failed to send reply to {}: {:#}", sensitive(&rcpt), e),
    }
}

/// Speak SMTP on one incoming connection.
async fn handle_connection(ctx: Arc<MailContext>, stream: TcpStream) -> anyhow::Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    writer.write_all(b"220 bridge-distd ESMTP\r\n").await?;

    let mut envelope_from: Option<String> = None;
    let mut rcpt_ok = false;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let verb = trimmed
            .split([' ', ':'])
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();

        match verb.as_str() {
            "HELO" | "EHLO" => {
                writer.write_all(b"250 bridge-distd\r\n").await?;
            }
            "MAIL" => {
                envelope_from = trimmed
                    .split_once(':')
                    .and_then(|(_, rest)| extract_addr(rest));
                writer.write_all(b"250 OK\r\n").await?;
            }
            "RCPT" => {
                let local = trimmed
                    .split_once(':')
                    .and_then(|(_, rest)| extract_addr(rest))
                    .and_then(|addr| addr.split('@').next().map(str::to_owned));
                if local.as_deref() == Some(ctx.local_part.as_str()) {
                    rcpt_ok = true;
                    writer.write_all(b"250 OK\r\n").await?;
                } else {
                    writer.write_all(b"550 no such user\r\n").await?;
                }
            }
            "DATA" => {
                if !rcpt_ok {
                    writer.write_all(b"503 need RCPT first\r\n").await?;
                    continue;
                }
                writer
                    .write_all(b"354 end data with <CRLF>.<CRLF>\r\n")
                    .await?;
                let (lines, oversized) = read_data(&mut reader).await?;
                if oversized {
                    writer.write_all(b"552 message too large\r\n").await?;
                } else {
                    writer.write_all(b"250 OK\r\n").await?;
                    process_message(&ctx, envelope_from.take(), lines).await;
                }
                rcpt_ok = false;
                envelope_from = None;
            }
            "RSET" => {
                envelope_from = None;
                rcpt_ok = false;
                writer.write_all(b"250 OK\r\n").await?;
            }
            "NOOP" => {
                writer.write_all(b"250 OK\r\n").await?;
            }
            "QUIT" => {
                writer.write_all(b"221 bye\r\n").await?;
                return Ok(());
            }
            _ => {
                writer.write_all(b"502 command not implemented\r\n").await?;
            }
        }
    }
}

/// Read a DATA body up to the terminating dot.  Returns the
/// dot-unstuffed lines and whether the body exceeded
/// [`MAX_MESSAGE_SIZE`] (in which case the lines are dropped but the
/// body is still drained).
async fn read_data(
    reader: &mut BufReader<OwnedReadHalf>,
) -> anyhow::Result<(Vec<String>, bool)> {
    let mut lines = Vec::new();
    let mut nbytes = 0_usize;
    let mut oversized = false;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            anyhow::bail!("connection closed inside DATA");
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed == "." {
            if oversized {
                lines.clear();
            }
            return Ok((lines, oversized));
        }
        nbytes += line.len();
        if nbytes > MAX_MESSAGE_SIZE {
            oversized = true;
        }
        if !oversized {
            // Dot-unstuffing; a lone "." was handled above.
            match trimmed.strip_prefix('.') {
                Some(rest) => lines.push(rest.to_owned()),
                None => lines.push(trimmed.to_owned()),
            }
        }
    }
}

/// Serve the email front on `listener`, forever.
pub(crate) async fn serve(listener: TcpListener, ctx: Arc<MailContext>) -> anyhow::Result<()> {
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("smtp connection from {}", sensitive(peer));
                    tasks.spawn(handle_connection(Arc::clone(&ctx), stream));
                }
                Err(e) => {
                    warn!("listener accept failure: {}", e);
                    continue;
                }
            },
            Some(finished) = tasks.join_next() => match finished {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("smtp connection ended with an error: {:#}", e),
                Err(e) => warn!("smtp connection task exited ungracefully: {}", e),
            },
        }
    }
}
