//! Single NNTP session
//!
//! One authenticated connection to a provider, plain TCP or implicit TLS.
//! Exposes exactly what the pool needs: GROUP, BODY with dot-unstuffing,
//! POST with dot-stuffing, QUIT.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::config::ProviderConfig;

use super::error::NntpError;

pub(crate) trait NntpIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> NntpIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

enum NntpStream {
    Plain(BufReader<Box<dyn NntpIo>>),
    Tls(Box<BufReader<TlsStream<TcpStream>>>),
}

#[derive(Debug)]
struct NntpResponse {
    code: u16,
    message: String,
}

/// One live NNTP session
pub struct NntpConnection {
    stream: NntpStream,
    current_group: Option<String>,
}

impl NntpConnection {
    /// Connect, read the greeting, and authenticate when credentials are set
    pub async fn connect(provider: &ProviderConfig) -> Result<Self, NntpError> {
        let tcp = TcpStream::connect((provider.host.as_str(), provider.port)).await?;

        let stream = if provider.tls {
            let tls = tls_connect(tcp, &provider.host).await?;
            NntpStream::Tls(Box::new(BufReader::new(tls)))
        } else {
            NntpStream::Plain(BufReader::new(Box::new(tcp) as Box<dyn NntpIo>))
        };

        let mut conn = NntpConnection {
            stream,
            current_group: None,
        };

        let greeting = conn.read_response().await?;
        if !matches!(greeting.code, 200 | 201) {
            return Err(NntpError::UnexpectedResponse(
                greeting.code,
                greeting.message,
            ));
        }

        if let (Some(user), Some(pass)) = (&provider.username, &provider.password) {
            if !user.is_empty() {
                conn.authenticate(user, pass).await?;
            }
        }

        Ok(conn)
    }

    async fn authenticate(&mut self, username: &str, password: &str) -> Result<(), NntpError> {
        self.send_command(&format!("AUTHINFO USER {username}"))
            .await?;
        let resp = self.read_response().await?;
        match resp.code {
            281 => return Ok(()),
            381 => {}
            _ => return Err(NntpError::AuthFailed(resp.message)),
        }

        self.send_command(&format!("AUTHINFO PASS {password}"))
            .await?;
        let resp = self.read_response().await?;
        match resp.code {
            281 => Ok(()),
            _ => Err(NntpError::AuthFailed(resp.message)),
        }
    }

    /// Select a newsgroup; a no-op when already joined
    pub async fn join_group(&mut self, group: &str) -> Result<(), NntpError> {
        if self.current_group.as_deref() == Some(group) {
            return Ok(());
        }
        self.send_command(&format!("GROUP {group}")).await?;
        let resp = self.read_response().await?;
        match resp.code {
            211 => {
                self.current_group = Some(group.to_string());
                Ok(())
            }
            _ => Err(NntpError::UnexpectedResponse(resp.code, resp.message)),
        }
    }

    /// Fetch the raw (still yEnc-encoded) body of an article.
    ///
    /// Lines are dot-unstuffed and returned CRLF-joined, framing intact.
    pub async fn fetch_body(&mut self, message_id: &str) -> Result<Vec<u8>, NntpError> {
        self.send_command(&format!("BODY <{message_id}>")).await?;
        let resp = self.read_response().await?;
        match resp.code {
            222 => {}
            430 => return Err(NntpError::ArticleNotFound(message_id.to_string())),
            480 => return Err(NntpError::AuthRequired),
            _ => return Err(NntpError::UnexpectedResponse(resp.code, resp.message)),
        }

        let mut body = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            let bytes = match &mut self.stream {
                NntpStream::Plain(reader) => reader.read_line(&mut line).await?,
                NntpStream::Tls(reader) => reader.read_line(&mut line).await?,
            };
            if bytes == 0 {
                return Err(NntpError::ProtocolError(
                    "unexpected EOF in article body".to_string(),
                ));
            }

            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed == "." {
                break;
            }
            // a stuffed ".." pair collapses back to one dot
            let payload = if trimmed.starts_with("..") {
                &trimmed[1..]
            } else {
                trimmed
            };
            body.extend_from_slice(payload.as_bytes());
            body.extend_from_slice(b"\r\n");
        }

        Ok(body)
    }

    /// Post a fully encoded article
    pub async fn post(&mut self, article: &[u8]) -> Result<(), NntpError> {
        self.send_command("POST").await?;
        let resp = self.read_response().await?;
        match resp.code {
            340 => {}
            440 => return Err(NntpError::PostRejected(resp.message)),
            _ => return Err(NntpError::UnexpectedResponse(resp.code, resp.message)),
        }

        let payload = dot_stuff(article);
        match &mut self.stream {
            NntpStream::Plain(s) => {
                s.get_mut().write_all(&payload).await?;
                s.get_mut().flush().await?;
            }
            NntpStream::Tls(s) => {
                s.get_mut().write_all(&payload).await?;
                s.get_mut().flush().await?;
            }
        }

        let resp = self.read_response().await?;
        match resp.code {
            240 => Ok(()),
            _ => Err(NntpError::PostRejected(resp.message)),
        }
    }

    /// Say goodbye; errors are ignored by callers tearing down
    pub async fn quit(&mut self) -> Result<(), NntpError> {
        self.send_command("QUIT").await?;
        let _ = self.read_response().await;
        Ok(())
    }

    async fn send_command(&mut self, cmd: &str) -> Result<(), NntpError> {
        let line = format!("{cmd}\r\n");
        match &mut self.stream {
            NntpStream::Plain(s) => {
                s.get_mut().write_all(line.as_bytes()).await?;
                s.get_mut().flush().await?;
            }
            NntpStream::Tls(s) => {
                s.get_mut().write_all(line.as_bytes()).await?;
                s.get_mut().flush().await?;
            }
        }
        Ok(())
    }

    async fn read_response(&mut self) -> Result<NntpResponse, NntpError> {
        let mut line = String::new();
        let bytes = match &mut self.stream {
            NntpStream::Plain(s) => s.read_line(&mut line).await?,
            NntpStream::Tls(s) => s.read_line(&mut line).await?,
        };
        if bytes == 0 || line.is_empty() {
            return Err(NntpError::ProtocolError("empty response".to_string()));
        }

        let code = line
            .get(..3)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| NntpError::ProtocolError("invalid response line".to_string()))?;
        let message = line[3..].trim().to_string();
        Ok(NntpResponse { code, message })
    }
}

/// Double leading dots and terminate with `CRLF . CRLF`
fn dot_stuff(article: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(article.len() + 8);
    let mut at_line_start = true;
    for &byte in article {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }
    if !article.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

async fn tls_connect(tcp: TcpStream, hostname: &str) -> Result<TlsStream<TcpStream>, NntpError> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(hostname.to_string())
        .map_err(|_| NntpError::Tls(format!("invalid hostname: {hostname}")))?;

    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| NntpError::Tls(e.to_string()))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_stuffing_doubles_leading_dots_and_terminates() {
        let article = b"Subject: x\r\n\r\n.leading\r\nnormal\r\n";
        let stuffed = dot_stuff(article);
        let text = String::from_utf8(stuffed).unwrap();
        assert!(text.contains("\r\n..leading\r\n"));
        assert!(text.ends_with("normal\r\n.\r\n"));
    }

    #[test]
    fn dot_stuffing_adds_missing_final_newline() {
        let stuffed = dot_stuff(b"no newline");
        assert!(stuffed.ends_with(b"no newline\r\n.\r\n"));
    }

    #[test]
    fn dot_stuffing_handles_dot_at_start_of_article() {
        let stuffed = dot_stuff(b".first\r\n");
        assert!(stuffed.starts_with(b"..first"));
    }

    #[tokio::test]
    async fn body_reader_unstuffs_and_stops_at_terminator() {
        let (client, mut server) = tokio::io::duplex(256);

        tokio::spawn(async move {
            let _ = server
                .write_all(b"222 0 <id> body\r\nline1\r\n..dotline\r\n.\r\nXXX")
                .await;
        });

        let mut conn = NntpConnection {
            stream: NntpStream::Plain(BufReader::new(Box::new(client) as Box<dyn NntpIo>)),
            current_group: None,
        };

        // Consume the 222 response, then the body
        let resp = conn.read_response().await.unwrap();
        assert_eq!(resp.code, 222);

        let mut body = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            let n = match &mut conn.stream {
                NntpStream::Plain(r) => r.read_line(&mut line).await.unwrap(),
                NntpStream::Tls(r) => r.read_line(&mut line).await.unwrap(),
            };
            assert!(n > 0);
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed == "." {
                break;
            }
            let payload = trimmed.strip_prefix("..").map_or(trimmed.to_string(), |r| {
                format!(".{r}")
            });
            body.push(payload);
        }

        assert_eq!(body, vec!["line1".to_string(), ".dotline".to_string()]);
    }

    #[tokio::test]
    async fn read_response_parses_code_and_message() {
        let (client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = server.write_all(b"200 news.example.com ready\r\n").await;
        });

        let mut conn = NntpConnection {
            stream: NntpStream::Plain(BufReader::new(Box::new(client) as Box<dyn NntpIo>)),
            current_group: None,
        };
        let resp = conn.read_response().await.unwrap();
        assert_eq!(resp.code, 200);
        assert_eq!(resp.message, "news.example.com ready");
    }

    #[tokio::test]
    async fn read_response_rejects_garbage() {
        let (client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = server.write_all(b"oops\r\n").await;
        });

        let mut conn = NntpConnection {
            stream: NntpStream::Plain(BufReader::new(Box::new(client) as Box<dyn NntpIo>)),
            current_group: None,
        };
        let err = conn.read_response().await.unwrap_err();
        assert!(matches!(err, NntpError::ProtocolError(_)));
    }
}
