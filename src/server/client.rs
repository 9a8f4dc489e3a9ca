use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{BrokerError, Result};
use crate::server::protocol::parse_reply;

/// Minimal line-protocol client, one request in flight at a time.
pub struct BrokerClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl BrokerClient {
    /// Connect and identify as `node`/`session`.
    pub async fn connect(addr: SocketAddr, node: &str, session: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer,
        };
        client
            .call(&format!("client_node={node} client_session={session}"))
            .await?;
        Ok(client)
    }

    /// Send one raw request line and return the raw reply line.
    pub async fn send(&mut self, request: &str) -> Result<String> {
        self.writer.write_all(request.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;

        let mut reply = String::new();
        if self.reader.read_line(&mut reply).await? == 0 {
            return Err(BrokerError::Protocol("connection closed by broker".into()));
        }
        Ok(reply.trim_end().to_string())
    }

    /// Send a request and decode an `OK:` reply. `ERR:` replies become errors.
    pub async fn call(&mut self, request: &str) -> Result<HashMap<String, String>> {
        let reply = self.send(request).await?;
        parse_reply(&reply)
    }

    pub async fn set_scope(&mut self, scope: &str) -> Result<()> {
        self.call(&format!("SETSCOPE scope={scope}")).await.map(|_| ())
    }

    /// Submit `payload`; returns the job key.
    pub async fn submit(&mut self, payload: &str) -> Result<String> {
        self.submit_with_affinity(payload, None).await
    }

    /// Submit `payload` tagged with comma-separated `affinity` tags.
    pub async fn submit_with_affinity(
        &mut self,
        payload: &str,
        affinity: Option<&str>,
    ) -> Result<String> {
        let escaped = payload.replace('\\', "\\\\").replace('"', "\\\"");
        let mut request = format!("SUBMIT input=\"{escaped}\"");
        if let Some(affinity) = affinity {
            request.push_str(&format!(" aff={affinity}"));
        }
        let mut values = self.call(&request).await?;
        values
            .remove("job_key")
            .ok_or_else(|| BrokerError::Protocol("SUBMIT reply without job_key".into()))
    }

    pub async fn quit(mut self) -> Result<()> {
        self.writer.write_all(b"QUIT\n").await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}
