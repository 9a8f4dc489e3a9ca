use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, FetchOutcome, FetchRequest};
use crate::error::{BrokerError, Result};
use crate::scheduler::{WaitHandle, WorkerId};
use crate::server::protocol::{parse_request, Request, Response, MAX_LINE_LEN};

/// Accepts line-protocol connections for a broker.
pub struct BrokerServer {
    listener: TcpListener,
    broker: Arc<Broker>,
}

impl BrokerServer {
    pub async fn bind(addr: SocketAddr, broker: Arc<Broker>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, broker })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `token` is cancelled. Each connection runs on its own task.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, queue = %self.broker.queue_name(), "Starting broker listener");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Broker listener stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    let broker = self.broker.clone();
                    let token = token.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, broker, token).await {
                            tracing::debug!(peer = %peer, error = %e, "Connection ended with error");
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<Broker>,
    token: CancellationToken,
) -> Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut session = Session {
        peer,
        identity: WorkerId::new(peer.ip().to_string(), peer.port().to_string()),
        listening: HashMap::new(),
    };
    let mut reader = BufReader::new(read_half);

    tracing::debug!(peer = %peer, "Connection opened");
    let result = serve_requests(&mut reader, &mut writer, &broker, &token, &mut session).await;

    // Only waits this connection registered are torn down with it.
    for (worker, handle) in session.listening {
        if broker.cancel_wait(handle) {
            tracing::debug!(worker = %worker, handle = %handle, "Listening wait cancelled on disconnect");
        }
    }
    tracing::debug!(peer = %peer, "Connection closed");
    result
}

/// Per-connection state.
struct Session {
    peer: SocketAddr,
    identity: WorkerId,
    /// Listening waits left behind by this connection's fetches, latest per
    /// identity it has used.
    listening: HashMap<WorkerId, WaitHandle>,
}

/// Outcome of reading one request line.
enum LineRead {
    Line(String),
    Eof,
    TooLong,
    NotUtf8,
}

/// Read one `\n`-terminated line of at most `MAX_LINE_LEN` bytes.
async fn read_request_line(
    reader: &mut BufReader<OwnedReadHalf>,
    buf: &mut Vec<u8>,
) -> std::io::Result<LineRead> {
    buf.clear();
    let read = (&mut *reader)
        .take(MAX_LINE_LEN as u64 + 1)
        .read_until(b'\n', buf)
        .await?;
    if read == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.last() != Some(&b'\n') && read > MAX_LINE_LEN {
        return Ok(LineRead::TooLong);
    }
    match std::str::from_utf8(buf) {
        Ok(line) => Ok(LineRead::Line(line.to_string())),
        Err(_) => Ok(LineRead::NotUtf8),
    }
}

async fn serve_requests(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    broker: &Broker,
    token: &CancellationToken,
    session: &mut Session,
) -> Result<()> {
    let mut buf = Vec::new();
    let peer = session.peer;

    loop {
        let read = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            read = read_request_line(reader, &mut buf) => read?,
        };
        let line = match read {
            LineRead::Eof => return Ok(()),
            LineRead::TooLong => {
                // No way to resynchronise mid-line; reply and hang up.
                let reply = Response::from(BrokerError::Protocol(format!(
                    "request longer than {MAX_LINE_LEN} bytes"
                )));
                return write_line(writer, &reply).await;
            }
            LineRead::NotUtf8 => {
                let reply =
                    Response::from(BrokerError::Protocol("request is not valid UTF-8".into()));
                write_line(writer, &reply).await?;
                continue;
            }
            LineRead::Line(line) => line,
        };
        if line.trim().is_empty() {
            continue;
        }

        let request = match parse_request(&line) {
            Ok(request) => request,
            Err(e) => {
                write_line(writer, &Response::from(e)).await?;
                continue;
            }
        };

        let reply = match request {
            Request::Quit => return Ok(()),
            Request::Hello {
                node,
                session: token_id,
            } => {
                session.identity = WorkerId::new(node, token_id);
                tracing::debug!(peer = %peer, worker = %session.identity, "Client identified");
                Response::Ok
            }
            Request::SetScope { scope } => {
                broker.set_scope(&session.identity, &scope).await;
                Response::Ok
            }
            Request::Submit {
                payload,
                affinities,
            } => match broker
                .submit_from(&session.identity, payload, affinities)
                .await
            {
                Ok(id) => Response::JobKey(id.to_string()),
                Err(e) => Response::from(e),
            },
            Request::Get2 {
                affinity,
                accept_unscoped,
                port,
                timeout_secs,
            } => {
                let fetch = FetchRequest {
                    worker: session.identity.clone(),
                    affinity,
                    accept_unscoped,
                    timeout_secs,
                    notify_addr: port.map(|p| SocketAddr::new(peer.ip(), p)),
                };
                match fetch_or_hangup(broker, fetch, reader).await {
                    Some(Ok(FetchOutcome::Claimed(job))) => Response::Job(job),
                    Some(Ok(FetchOutcome::Listening(handle))) => {
                        session
                            .listening
                            .insert(session.identity.clone(), handle);
                        Response::Ok
                    }
                    Some(Ok(FetchOutcome::Empty)) => Response::Ok,
                    Some(Err(e)) => Response::from(e),
                    None => {
                        tracing::debug!(peer = %peer, worker = %session.identity, "Peer hung up during fetch");
                        return Ok(());
                    }
                }
            }
        };

        write_line(writer, &reply).await?;
    }
}

/// Run a fetch while watching the socket for EOF. Returns `None` when the
/// peer disconnected before the fetch finished; the dropped fetch cleans up
/// its own wait.
async fn fetch_or_hangup<R>(
    broker: &Broker,
    request: FetchRequest,
    reader: &mut BufReader<R>,
) -> Option<Result<FetchOutcome>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let fetch = broker.fetch(request);
    tokio::pin!(fetch);
    let mut watching = true;

    loop {
        tokio::select! {
            outcome = &mut fetch => return Some(outcome),
            buffered = reader.fill_buf(), if watching => match buffered {
                Ok(buf) if buf.is_empty() => return None,
                // Pipelined input; it is read after this fetch completes.
                Ok(_) => watching = false,
                Err(_) => return None,
            },
        }
    }
}

async fn write_line<W>(writer: &mut W, response: &Response) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut line = response.to_line();
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}
