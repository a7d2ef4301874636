mod authz;
mod transport;

pub use self::authz::Authorizer;
use self::authz::Action;
use self::transport::{response_stream, Envelope, GrpcTransport};

use crate::interceptors::cert::caller_of;
use bytes::Bytes;
use futures::Stream;
use joblib::error::Error as JobError;
use joblib::types::CallerId;
use joblib::JobService;
use protobuf::remote_jobs_server::RemoteJobs;
use protobuf::{
    CrashRequest, CrashResponse, PidRequest, PidResponse, StatsRequest, StatsResponse,
    SubmitRequest, SubmitResponse,
};
use std::io;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::io::StreamReader;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

// tonic wraps this in Arc anyway internally, so we don't need Arc
pub struct RemoteJobsService {
    jobs: JobService,
    authorizer: Authorizer,
    response_capacity: usize,
    notice_deadline: Duration,
}

impl RemoteJobsService {
    /// `response_capacity` bounds each job's response stream, `notice_deadline` is how long a
    /// status notice may wait for the caller to take it.
    pub fn new(
        jobs: JobService,
        authorizer: Authorizer,
        response_capacity: usize,
        notice_deadline: Duration,
    ) -> Self {
        Self {
            jobs,
            authorizer,
            response_capacity: response_capacity.max(1),
            notice_deadline,
        }
    }

    fn authorize(&self, caller: &str, action: Action) -> Result<(), Status> {
        if self.authorizer.is_authorized(caller, action) {
            Ok(())
        } else {
            Err(Status::permission_denied("Permission denied"))
        }
    }

    /// Run the uploaded chunks as one job on its own task, streaming the result back.
    fn spawn_job<S>(&self, caller: CallerId, upload: S) -> ResponseStream<SubmitResponse>
    where
        S: Stream<Item = Result<SubmitRequest, Status>> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(self.response_capacity);
        let jobs = self.jobs.clone();
        let notice_deadline = self.notice_deadline;
        tokio::spawn(async move {
            let input = StreamReader::new(upload.map(|chunk| {
                chunk
                    .map(|req| Bytes::from(req.data))
                    .map_err(|status| io::Error::new(io::ErrorKind::Other, status.to_string()))
            }));
            let mut transport = GrpcTransport::new(tx.clone(), notice_deadline);
            if let Err(err) = jobs.submit(&caller, input, &mut transport).await {
                warn!(%err, %caller, "job submission failed");
                let _ = tx
                    .send(Envelope::untracked(Err(job_error_status(&err))))
                    .await;
            }
        });
        Box::pin(response_stream(rx))
    }
}

fn job_error_status(err: &JobError) -> Status {
    match err {
        JobError::Input(_) => Status::aborted(err.to_string()),
        JobError::Delivery(_) => Status::unavailable(err.to_string()),
        JobError::Spawn { .. }
        | JobError::Wait(_)
        | JobError::Output(_)
        | JobError::Persist(_)
        | JobError::StatsFormat(_)
        | JobError::AccountantStopped => Status::internal(err.to_string()),
    }
}

#[tonic::async_trait]
impl RemoteJobs for RemoteJobsService {
    type SubmitJobStream = ResponseStream<SubmitResponse>;
    type QueryPidStream = ResponseStream<PidResponse>;

    async fn submit_job(
        &self,
        req: Request<Streaming<SubmitRequest>>,
    ) -> Result<Response<Self::SubmitJobStream>, Status> {
        let caller = caller_of(&req)?;
        self.authorize(&caller, Action::SubmitJob)?;
        Ok(Response::new(self.spawn_job(caller, req.into_inner())))
    }

    async fn query_stats(
        &self,
        req: Request<StatsRequest>,
    ) -> Result<Response<StatsResponse>, Status> {
        let caller = caller_of(&req)?;
        self.authorize(&caller, Action::QueryStats)?;

        let stats = self
            .jobs
            .accountant()
            .get_or_create(&caller)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;
        Ok(Response::new(StatsResponse {
            executions: stats.executions,
            input_size: stats.input_size,
            output_size: stats.output_size,
            processing_time: stats.processing_time,
            crashes: stats.crashes,
            executions_killed: stats.executions_killed,
        }))
    }

    async fn report_crash(
        &self,
        req: Request<CrashRequest>,
    ) -> Result<Response<CrashResponse>, Status> {
        let caller = caller_of(&req)?;
        self.authorize(&caller, Action::ReportCrash)?;

        self.jobs
            .accountant()
            .record_crash(&caller)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;
        Ok(Response::new(CrashResponse {}))
    }

    async fn query_pid(
        &self,
        req: Request<PidRequest>,
    ) -> Result<Response<Self::QueryPidStream>, Status> {
        let caller = caller_of(&req)?;
        // anyone but the admin is left without an answer rather than denied
        let answer = match self.authorize(&caller, Action::QueryPid) {
            Ok(()) => vec![Ok(PidResponse {
                pid: std::process::id(),
            })],
            Err(_) => {
                debug!(%caller, "ignoring pid query from non-admin caller");
                vec![]
            }
        };
        Ok(Response::new(
            Box::pin(tokio_stream::iter(answer)) as Self::QueryPidStream
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptors::cert::CallerExtension;
    use joblib::delivery::DeliveryPolicy;
    use joblib::executor::{ExecutorConfig, JobExecutor};
    use joblib::store::StatsStore;
    use joblib::types::StatsMap;
    use joblib::UsageAccountant;
    use protobuf::{notice::Kind, submit_response::Event};
    use std::sync::Arc;

    struct DiscardStore;

    #[tonic::async_trait]
    impl StatsStore for DiscardStore {
        async fn save(&self, _stats: &StatsMap) -> joblib::error::Result<()> {
            Ok(())
        }
    }

    fn service(script: &str) -> RemoteJobsService {
        service_with(script, DeliveryPolicy::default())
    }

    fn service_with(script: &str, policy: DeliveryPolicy) -> RemoteJobsService {
        let executor = JobExecutor::new(ExecutorConfig {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            envs: vec![],
            deadline: Duration::from_secs(10),
        });
        let accountant = UsageAccountant::spawn(StatsMap::new(), Arc::new(DiscardStore), 8);
        let jobs = JobService::new(executor, accountant, policy);
        RemoteJobsService::new(
            jobs,
            Authorizer::new(Some("admin".into())),
            4,
            Duration::from_secs(1),
        )
    }

    fn request_from<T>(caller: &str, message: T) -> Request<T> {
        let mut req = Request::new(message);
        req.extensions_mut().insert(CallerExtension {
            caller_id: caller.into(),
        });
        req
    }

    fn upload(
        chunks: Vec<Result<&'static [u8], Status>>,
    ) -> impl Stream<Item = Result<SubmitRequest, Status>> + Send + Unpin + 'static {
        tokio_stream::iter(chunks.into_iter().map(|chunk| {
            chunk.map(|data| SubmitRequest {
                data: data.to_vec(),
            })
        }))
    }

    #[tokio::test]
    async fn chunked_upload_runs_as_one_job() {
        let service = service("cat");
        let responses: Vec<_> = service
            .spawn_job("alice".into(), upload(vec![Ok(b"hel"), Ok(b"lo")]))
            .collect()
            .await;
        assert_eq!(responses.len(), 1);
        let response = responses.into_iter().next().unwrap().unwrap();
        assert_eq!(response.event, Some(Event::Output(b"hello".to_vec())));

        let stats = service
            .query_stats(request_from("alice", StatsRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(stats.executions, 1);
        assert_eq!(stats.input_size, 5);
        assert_eq!(stats.output_size, 5);
    }

    #[tokio::test]
    async fn failing_program_gets_a_notice() {
        let service = service("exit 4");
        let responses: Vec<_> = service
            .spawn_job("bob".into(), upload(vec![Ok(b"x")]))
            .collect()
            .await;
        match &responses[..] {
            [Ok(SubmitResponse {
                event: Some(Event::Notice(notice)),
            })] => {
                assert_eq!(notice.kind(), Kind::Killed);
                assert_eq!(notice.text, "Execution killed with exit code: 4");
            }
            other => panic!("unexpected responses {:?}", other),
        }
    }

    #[tokio::test]
    async fn slow_reader_is_warned_then_gets_the_output() {
        let service = service_with(
            "cat",
            DeliveryPolicy {
                deadline: Duration::from_millis(50),
                extended_deadline: Duration::from_secs(5),
                ..DeliveryPolicy::default()
            },
        );
        let responses = service.spawn_job("erin".into(), upload(vec![Ok(b"late")]));
        // let the first upload attempt run out before reading anything
        tokio::time::sleep(Duration::from_millis(500)).await;
        let received: Vec<_> = responses.collect().await;

        match &received[..] {
            [Ok(SubmitResponse {
                event: Some(Event::Notice(notice)),
            }), Ok(SubmitResponse {
                event: Some(Event::Output(output)),
            })] => {
                assert_eq!(notice.kind(), Kind::SlowUpload);
                assert_eq!(output, b"late");
            }
            other => panic!("unexpected responses {:?}", other),
        }
    }

    #[tokio::test]
    async fn broken_upload_ends_with_an_error() {
        let service = service("cat");
        let responses: Vec<_> = service
            .spawn_job(
                "carol".into(),
                upload(vec![Ok(b"part"), Err(Status::cancelled("client went away"))]),
            )
            .collect()
            .await;
        match &responses[..] {
            [Err(status)] => assert_eq!(status.code(), tonic::Code::Aborted),
            other => panic!("unexpected responses {:?}", other),
        }
    }

    #[tokio::test]
    async fn crash_reports_are_counted() {
        let service = service("cat");
        service
            .report_crash(request_from("dave", CrashRequest {}))
            .await
            .unwrap();
        let stats = service
            .query_stats(request_from("dave", StatsRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(stats.crashes, 1);
        assert_eq!(stats.executions, 0);
    }

    #[tokio::test]
    async fn pid_is_only_told_to_the_admin() {
        let service = service("cat");
        let answer: Vec<_> = service
            .query_pid(request_from("admin", PidRequest {}))
            .await
            .unwrap()
            .into_inner()
            .collect()
            .await;
        assert_eq!(answer.len(), 1);
        assert_eq!(answer[0].as_ref().unwrap().pid, std::process::id());

        let silence: Vec<_> = service
            .query_pid(request_from("mallory", PidRequest {}))
            .await
            .unwrap()
            .into_inner()
            .collect()
            .await;
        assert!(silence.is_empty());
    }

    #[tokio::test]
    async fn requests_without_identity_are_rejected() {
        let service = service("cat");
        let err = service
            .query_stats(Request::new(StatsRequest {}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);
    }
}
