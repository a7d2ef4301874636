use joblib::types::CallerId;

pub enum Action {
    SubmitJob,
    QueryStats,
    ReportCrash,
    QueryPid,
}

/// Decides what a caller may do.
///
/// Any authenticated caller may run jobs and look after its own usage. Querying the server's
/// process id is reserved for the single configured administrator.
#[derive(Clone, Debug, Default)]
pub struct Authorizer {
    admin: Option<CallerId>,
}

impl Authorizer {
    pub fn new(admin: Option<CallerId>) -> Self {
        Self { admin }
    }

    pub fn is_authorized(&self, caller: &str, action: Action) -> bool {
        use Action::*;
        match action {
            SubmitJob | QueryStats | ReportCrash => true,
            QueryPid => self.is_admin(caller),
        }
    }

    fn is_admin(&self, caller: &str) -> bool {
        self.admin.as_deref() == Some(caller)
    }
}
