use joblib::types::CallerId;
use tonic::{Request, Status};
use x509_parser::{
    certificate::X509Certificate, der_parser::ber::BerObjectContent, oid_registry::Oid,
    traits::FromDer,
};

// oid for the subject UID.
const SUBJECT_UID_OID: &[u64] = &[0, 9, 2342, 19200300, 100, 1, 1];

/// A tonic interceptor service function.
///
/// Extracts the subject uid from the client certificate and adds it to the request extensions
/// as the caller's identity.
pub fn extract_caller_id(mut req: Request<()>) -> Result<Request<()>, Status> {
    // extract the client certs
    let client_certs = req
        .peer_certs()
        .ok_or_else(|| Status::unauthenticated("Request missing client cert"))?;
    let leaf = client_certs
        .first()
        .ok_or_else(|| Status::unauthenticated("Request missing client cert"))?;

    // rustls hands the certificate over DER encoded
    let caller_id = caller_id_from_der(leaf.get_ref())?;
    req.extensions_mut().insert(CallerExtension { caller_id });
    Ok(req)
}

fn caller_id_from_der(der: &[u8]) -> Result<CallerId, Status> {
    let (rem, cert) =
        X509Certificate::from_der(der).map_err(|_| Status::unauthenticated("Bad client cert"))?;
    if !rem.is_empty() {
        return Err(Status::unauthenticated("Bad client cert"));
    }
    let oid = Oid::from(SUBJECT_UID_OID)
        .map_err(|_| Status::internal("oid parse error: subject uid"))?;
    let uid = cert
        .subject()
        .iter_by_oid(&oid)
        .next()
        .ok_or_else(|| Status::unauthenticated("Client cert missing subject uid"))?;
    match uid.attr_value().content {
        BerObjectContent::UTF8String(caller) => Ok(CallerId::from(caller)),
        _ => Err(Status::unauthenticated("Client cert uid must be UTF8")),
    }
}

#[derive(Clone, Debug)]
pub struct CallerExtension {
    pub caller_id: CallerId,
}

/// The caller id the interceptor attached to `req`.
pub fn caller_of<T>(req: &Request<T>) -> Result<CallerId, Status> {
    req.extensions()
        .get::<CallerExtension>()
        .map(|ext| ext.caller_id.clone())
        .ok_or_else(|| Status::unauthenticated("Request missing caller identity"))
}
