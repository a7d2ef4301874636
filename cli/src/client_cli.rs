use anyhow::{bail, Context};
use protobuf::{
    notice::Kind, remote_jobs_client::RemoteJobsClient, submit_response::Event, CrashRequest,
    PidRequest, StatsRequest, SubmitRequest, SubmitResponse,
};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tonic::Request;
use tracing::debug;

/// Bytes per upload message.
pub const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

pub struct ClientCli {
    inner: RemoteJobsClient<Channel>,
}

impl ClientCli {
    pub async fn connect(
        server_addr: &str,
        domain: &str,
        ca: &Path,
        cert: &Path,
        key: &Path,
    ) -> anyhow::Result<Self> {
        let server_root_ca_cert = tokio::fs::read(ca)
            .await
            .with_context(|| format!("failed to read {}", ca.display()))?;
        let client_cert = tokio::fs::read(cert)
            .await
            .with_context(|| format!("failed to read {}", cert.display()))?;
        let client_key = tokio::fs::read(key)
            .await
            .with_context(|| format!("failed to read {}", key.display()))?;

        let tls = ClientTlsConfig::new()
            .domain_name(domain)
            .ca_certificate(Certificate::from_pem(server_root_ca_cert))
            .identity(Identity::from_pem(client_cert, client_key));
        let channel = Channel::from_shared(format!("https://{}", server_addr))?
            .tls_config(tls)?
            .connect()
            .await
            .with_context(|| format!("failed to connect to {}", server_addr))?;
        debug!(server_addr, "connected");

        Ok(Self {
            inner: RemoteJobsClient::new(channel),
        })
    }

    /// Upload `input` as one job. The output is written to `output`, notices go to stderr.
    pub async fn submit<R, W>(&mut self, input: R, output: &mut W) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let chunks = upload_chunks(input).await?;
        debug!(chunks = chunks.len(), "uploading job input");
        let mut stream = self
            .inner
            .submit_job(Request::new(tokio_stream::iter(chunks)))
            .await?
            .into_inner();

        let mut failed = false;
        while let Some(SubmitResponse { event }) = stream.message().await? {
            match event {
                Some(Event::Output(data)) => {
                    output.write_all(&data).await?;
                    output.flush().await?;
                }
                Some(Event::Notice(notice)) => {
                    eprintln!("{}", notice.text);
                    failed |= is_failure(notice.kind());
                }
                None => bail!("server sent an empty response"),
            }
        }
        if failed {
            bail!("job produced no output");
        }
        Ok(())
    }

    pub async fn query_stats(&mut self) -> anyhow::Result<()> {
        let stats = self
            .inner
            .query_stats(Request::new(StatsRequest {}))
            .await?
            .into_inner();
        println!("Executions: {}", stats.executions);
        println!("Input size: {} bytes", stats.input_size);
        println!("Output size: {} bytes", stats.output_size);
        println!("Processing time: {} ns", stats.processing_time);
        println!("Crashes: {}", stats.crashes);
        println!("Executions killed: {}", stats.executions_killed);
        Ok(())
    }

    pub async fn report_crash(&mut self) -> anyhow::Result<()> {
        self.inner.report_crash(Request::new(CrashRequest {})).await?;
        println!("Crash reported");
        Ok(())
    }

    pub async fn query_pid(&mut self) -> anyhow::Result<()> {
        let mut stream = self
            .inner
            .query_pid(Request::new(PidRequest {}))
            .await?
            .into_inner();
        match stream.message().await? {
            Some(answer) => println!("{}", answer.pid),
            // the server stays silent unless we are its admin
            None => bail!("no answer from the server"),
        }
        Ok(())
    }
}

/// Whether a notice means the job gave no usable output. The rest are informational.
fn is_failure(kind: Kind) -> bool {
    match kind {
        Kind::SlowUpload | Kind::EmptyOutput => false,
        Kind::Killed | Kind::TimedOut | Kind::TooLarge | Kind::UploadFailed => true,
    }
}

async fn upload_chunks<R: AsyncRead + Unpin>(mut input: R) -> anyhow::Result<Vec<SubmitRequest>> {
    let mut chunks = Vec::new();
    loop {
        let mut data = Vec::with_capacity(UPLOAD_CHUNK_SIZE);
        let read = (&mut input)
            .take(UPLOAD_CHUNK_SIZE as u64)
            .read_to_end(&mut data)
            .await
            .context("failed to read job input")?;
        if read == 0 {
            break;
        }
        chunks.push(SubmitRequest { data });
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn input_is_split_into_chunks() {
        let input = vec![7u8; UPLOAD_CHUNK_SIZE * 2 + 10];
        let chunks = upload_chunks(&input[..]).await.unwrap();
        let sizes: Vec<_> = chunks.iter().map(|c| c.data.len()).collect();
        assert_eq!(sizes, vec![UPLOAD_CHUNK_SIZE, UPLOAD_CHUNK_SIZE, 10]);
    }

    #[test]
    fn informational_notices_are_not_failures() {
        assert!(!is_failure(Kind::EmptyOutput));
        assert!(!is_failure(Kind::SlowUpload));
        assert!(is_failure(Kind::Killed));
        assert!(is_failure(Kind::UploadFailed));
    }

    #[tokio::test]
    async fn empty_input_sends_no_chunks() {
        let chunks = upload_chunks(&b""[..]).await.unwrap();
        assert!(chunks.is_empty());
    }
}
