//! End-to-end tests for the queue endpoint over mutual TLS

use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use granary_server::client::Client;
use granary_server::endpoint::Endpoint;
use granary_server::queue::{Job, Queue};
use granary_server::queuemap::{QueueFactory, QueueMap};
use granary_server::tls;

struct TestCa {
    cert: Certificate,
    key: KeyPair,
}

fn make_ca(name: &str) -> TestCa {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(Vec::new()).unwrap();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.distinguished_name.push(DnType::CommonName, name);
    let cert = params.self_signed(&key).unwrap();
    TestCa { cert, key }
}

fn make_identity(ca: &TestCa, name: &str) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    params.distinguished_name.push(DnType::CommonName, name);
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    let cert = params.signed_by(&key, &ca.cert, &ca.key).unwrap();
    (
        cert.der().clone(),
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
    )
}

fn test_factory() -> QueueFactory {
    Box::new(|placement| {
        Ok(Arc::new(Queue::new(
            placement,
            Duration::from_secs(3600),
            64,
            1000,
            0,
        )))
    })
}

fn job(stream: u8, placement: u16, health: f64) -> Job {
    Job {
        stream_id: [stream; 16],
        position: u64::from(stream),
        segment_health: health,
        placement,
        inserted_at: 0,
        updated_at: 0,
        last_attempted_at: 0,
    }
}

/// Spin up a served endpoint; returns its address, a shutdown token, and
/// the server's certificate.
async fn serve(ca: &TestCa) -> (String, CancellationToken, CertificateDer<'static>) {
    let (server_cert, server_key) = make_identity(ca, "queue server");
    let acceptor = tls::acceptor_from_parts(
        vec![server_cert.clone()],
        server_key,
        Some(vec![ca.cert.der().clone()]),
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let endpoint = Endpoint::new(Arc::new(QueueMap::new(test_factory())));

    let token = CancellationToken::new();
    let serve_token = token.clone();
    tokio::spawn(async move {
        let _ = endpoint.serve(listener, acceptor, serve_token).await;
    });
    (addr, token, server_cert)
}

async fn connect(ca: &TestCa, addr: &str) -> Client {
    let (client_cert, client_key) = make_identity(ca, "repair worker");
    let connector =
        tls::connector_from_parts(vec![ca.cert.der().clone()], vec![client_cert], client_key)
            .unwrap();
    Client::connect(addr, "localhost", connector).await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_push_pop_in_priority_order() {
    let ca = make_ca("test ca");
    let (addr, token, _server_cert) = serve(&ca).await;
    let mut client = connect(&ca, &addr).await;

    client.push(job(1, 0, 0.3)).await.unwrap();
    client.push(job(2, 0, 0.1)).await.unwrap();
    client.push(job(3, 0, 0.2)).await.unwrap();

    assert_eq!(client.len(0).await.unwrap(), (3, 0));

    let mut healths = Vec::new();
    while let Some(job) = client.pop(0).await.unwrap() {
        healths.push(job.segment_health);
    }
    assert_eq!(healths, vec![0.1, 0.2, 0.3]);

    token.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_peek_stat_destroy() {
    let ca = make_ca("test ca");
    let (addr, token, _server_cert) = serve(&ca).await;
    let mut client = connect(&ca, &addr).await;

    let outcome = client
        .push_batch(vec![job(1, 2, 0.5), job(2, 2, 0.25), job(3, 3, 4.0)])
        .await
        .unwrap();
    assert_eq!(outcome.pushed, 3);

    let peeked = client.peek(2).await.unwrap().unwrap();
    assert_eq!(peeked.segment_health, 0.25);
    assert_eq!(client.len(2).await.unwrap(), (2, 0));

    let stat = client.stat(2).await.unwrap();
    assert_eq!(stat.count, 2);
    assert_eq!(stat.min_health, 0.25);
    assert_eq!(stat.max_health, 0.5);

    assert_eq!(client.trim(1.0).await.unwrap(), 1);
    assert!(client.destroy(3).await.unwrap());
    assert!(!client.destroy(3).await.unwrap());

    token.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_capacity_error_crosses_wire() {
    let ca = make_ca("test ca");
    let (server_cert, server_key) = make_identity(&ca, "queue server");
    let acceptor = tls::acceptor_from_parts(
        vec![server_cert],
        server_key,
        Some(vec![ca.cert.der().clone()]),
    )
    .unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    // capacity of two elements
    let factory: QueueFactory = Box::new(|placement| {
        Ok(Arc::new(Queue::new(
            placement,
            Duration::from_secs(3600),
            4,
            2,
            0,
        )))
    });
    let endpoint = Endpoint::new(Arc::new(QueueMap::new(factory)));
    let token = CancellationToken::new();
    let serve_token = token.clone();
    tokio::spawn(async move {
        let _ = endpoint.serve(listener, acceptor, serve_token).await;
    });

    let mut client = connect(&ca, &addr).await;
    client.push(job(1, 0, 0.5)).await.unwrap();
    client.push(job(2, 0, 0.1)).await.unwrap();

    let err = client.push(job(3, 0, 0.9)).await.unwrap_err();
    assert!(matches!(err, granary_core::Error::Capacity(_)), "got {err}");

    // the connection stays usable after an application error
    assert_eq!(client.len(0).await.unwrap(), (2, 0));

    token.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unauthorized_peer_rejected() {
    let server_ca = make_ca("server ca");
    let (addr, token, _server_cert) = serve(&server_ca).await;

    // a peer with an identity from a different CA fails the handshake
    let rogue_ca = make_ca("rogue ca");
    let (client_cert, client_key) = make_identity(&rogue_ca, "intruder");
    let connector = tls::connector_from_parts(
        vec![server_ca.cert.der().clone()],
        vec![client_cert],
        client_key,
    )
    .unwrap();

    let result = async {
        let mut client = Client::connect(&addr, "localhost", connector).await?;
        client.pop(0).await
    }
    .await;
    assert!(result.is_err());

    token.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pinned_server_certificate_dialer() {
    let ca = make_ca("test ca");
    let (addr, token, server_cert) = serve(&ca).await;

    // dial by pinning the exact server certificate instead of a CA chain
    let (client_cert, client_key) = make_identity(&ca, "pinning worker");
    let connector = tls::PinnedServerCert::connector(
        vec![server_cert],
        vec![client_cert],
        client_key,
    )
    .unwrap();
    let mut client = Client::connect(&addr, "localhost", connector).await.unwrap();

    client.push(job(1, 0, 1.5)).await.unwrap();
    assert_eq!(client.pop(0).await.unwrap().unwrap().segment_health, 1.5);

    token.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_node_id_is_stable() {
    let ca = make_ca("test ca");
    let (cert, _key) = make_identity(&ca, "node");
    let id1 = tls::peer_node_id(&[cert.clone()]).unwrap();
    let id2 = tls::peer_node_id(&[cert]).unwrap();
    assert_eq!(id1, id2);
    assert!(tls::peer_node_id(&[]).is_err());
}
