//! Calls over an encrypted link with a throwaway self-signed certificate.

mod common;

use std::sync::Arc;

use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use serde_json::json;

use common::{Broker, Mode, TestClient, TEST_TIMEOUT};
use stomp_jsonrpc::reactor::{Reactor, StaticTlsMaterial, TlsMaterialProvider, TlsState};
use stomp_jsonrpc::rpc::{ClientPolicy, JsonRpcRequest};

fn material() -> (Arc<dyn TlsMaterialProvider>, CertificateDer<'static>) {
    let rcgen::CertifiedKey { cert, signing_key } =
        generate_simple_self_signed(vec!["localhost".into(), "127.0.0.1".into()]).unwrap();
    let cert_der = cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(signing_key.serialize_der());
    let material =
        StaticTlsMaterial::from_der(vec![cert_der.clone()], Some((vec![cert_der.clone()], key_der.into())))
            .unwrap();
    (Arc::new(material), cert_der)
}

#[test]
fn test_call_over_tls() {
    let (server_material, cert) = material();
    let broker = Broker::start_on(Reactor::with_tls(server_material).unwrap(), Mode::Echo, true);

    let client_material = StaticTlsMaterial::from_der(vec![cert], None).unwrap();
    let reactor = Reactor::with_tls(Arc::new(client_material)).unwrap();
    assert!(reactor.is_tls());
    let test = TestClient::on(reactor, "127.0.0.1", broker.port(), ClientPolicy::default());

    let response = test
        .client
        .call(JsonRpcRequest::new("echo", json!({"secure": true}), "tls-1"))
        .unwrap()
        .wait(Some(TEST_TIMEOUT))
        .unwrap();

    assert_eq!(response.result(), Some(&json!({"secure": true})));
    assert_eq!(test.client.stomp().transport().tls_state(), TlsState::Established);
}

#[test]
fn test_untrusted_certificate_fails_connect() {
    let (server_material, _) = material();
    let broker = Broker::start_on(Reactor::with_tls(server_material).unwrap(), Mode::Echo, true);

    // Trust a different certificate than the one the broker presents.
    let (_, stranger) = material();
    let client_material = StaticTlsMaterial::from_der(vec![stranger], None).unwrap();
    let reactor = Reactor::with_tls(Arc::new(client_material)).unwrap();
    let test = TestClient::on(reactor, "127.0.0.1", broker.port(), ClientPolicy::default());

    assert!(test.client.connect().is_err());
    assert!(!test.client.is_connected());
    assert_eq!(broker.connects(), 0);
}
