use futures::Stream;
use joblib::delivery::{Notice, Transport, TransportError};
use joblib::types::OutputBlob;
use protobuf::{notice::Kind, submit_response::Event, SubmitResponse};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tonic::Status;

/// One queued response, with the sender waiting to hear that it was taken.
pub struct Envelope {
    response: Result<SubmitResponse, Status>,
    taken: Option<oneshot::Sender<()>>,
}

impl Envelope {
    /// A response nobody waits on, such as the final error of a failed job.
    pub fn untracked(response: Result<SubmitResponse, Status>) -> Self {
        Self {
            response,
            taken: None,
        }
    }
}

pub type ResponseSender = mpsc::Sender<Envelope>;

/// The `SubmitJob` response stream handed to tonic.
///
/// Every envelope pulled off the channel acknowledges its sender. An envelope whose sender
/// already gave up is dropped, so a timed out upload never reaches the caller late.
pub fn response_stream(
    rx: mpsc::Receiver<Envelope>,
) -> impl Stream<Item = Result<SubmitResponse, Status>> + Send + 'static {
    ReceiverStream::new(rx).filter_map(|envelope| match envelope.taken {
        Some(taken) => taken.send(()).ok().map(|()| envelope.response),
        None => Some(envelope.response),
    })
}

/// Delivers job results into a `SubmitJob` response stream.
///
/// A send only counts once tonic has pulled the message off the stream. A caller that does not
/// read within the deadline is a timed out upload.
pub struct GrpcTransport {
    tx: ResponseSender,
    notice_deadline: Duration,
}

impl GrpcTransport {
    pub fn new(tx: ResponseSender, notice_deadline: Duration) -> Self {
        Self {
            tx,
            notice_deadline,
        }
    }

    async fn send(&self, response: SubmitResponse, deadline: Duration) -> Result<(), TransportError> {
        let (taken, ack) = oneshot::channel();
        let envelope = Envelope {
            response: Ok(response),
            taken: Some(taken),
        };
        let sent = async {
            self.tx
                .send(envelope)
                .await
                .map_err(|_| TransportError::Closed)?;
            // the stream drops the ack sender unanswered only when it is dropped itself
            ack.await.map_err(|_| TransportError::Closed)
        };
        time::timeout(deadline, sent)
            .await
            .map_err(|_| TransportError::TimedOut)?
    }
}

#[tonic::async_trait]
impl Transport for GrpcTransport {
    async fn send_notice(&mut self, notice: &Notice) -> Result<(), TransportError> {
        self.send(notice_response(notice), self.notice_deadline)
            .await
    }

    async fn send_output(
        &mut self,
        output: OutputBlob,
        deadline: Duration,
    ) -> Result<(), TransportError> {
        let response = SubmitResponse {
            event: Some(Event::Output(output.to_vec())),
        };
        self.send(response, deadline).await
    }
}

pub fn notice_response(notice: &Notice) -> SubmitResponse {
    let kind = match notice {
        Notice::Killed { .. } => Kind::Killed,
        Notice::TimedOut { .. } => Kind::TimedOut,
        Notice::EmptyOutput => Kind::EmptyOutput,
        Notice::TooLarge { .. } => Kind::TooLarge,
        Notice::SlowUpload => Kind::SlowUpload,
        Notice::UploadFailed => Kind::UploadFailed,
    };
    SubmitResponse {
        event: Some(Event::Notice(protobuf::Notice {
            kind: kind as i32,
            text: notice.to_string(),
        })),
    }
}
