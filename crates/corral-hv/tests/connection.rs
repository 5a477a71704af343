//! HypervisorConnection behaviour against the in-memory driver.

use corral_hv::{ConsoleTarget, DomainSpec, HvError, HypervisorConnection, MockDriver};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_test::assert_ok;

fn mock_connection() -> (HypervisorConnection, Arc<MockDriver>) {
    let driver = Arc::new(MockDriver::new());
    let conn = HypervisorConnection::with_driver("qemu:///session", driver.clone());
    (conn, driver)
}

#[tokio::test]
async fn test_operations_require_open() {
    let (conn, _driver) = mock_connection();
    assert!(!conn.is_open());

    assert!(matches!(conn.list_domains().await, Err(HvError::NotConnected)));
    assert!(matches!(
        conn.create_domain(&DomainSpec::new("box")).await,
        Err(HvError::NotConnected)
    ));
}

#[tokio::test]
async fn test_open_rejects_malformed_uri() {
    for uri in ["", "no-scheme", "://host/"] {
        let conn = HypervisorConnection::with_driver(uri, Arc::new(MockDriver::new()));
        let err = conn.open().await.unwrap_err();
        assert!(matches!(err, HvError::InvalidUri { .. }), "{uri}: {err}");
        assert!(!conn.is_open());
    }
}

#[tokio::test]
async fn test_open_unknown_scheme_fails() {
    let conn = HypervisorConnection::new("bogus:///system");
    let err = conn.open().await.unwrap_err();
    assert!(matches!(err, HvError::Connection(_)));
    assert!(!conn.is_open());
}

#[tokio::test]
async fn test_open_unreachable_backend_fails() {
    let driver = Arc::new(MockDriver::unreachable("no such socket"));
    let conn = HypervisorConnection::with_driver("qemu:///session", driver);
    let err = conn.open().await.unwrap_err();
    assert!(err.to_string().contains("no such socket"));
    assert!(!conn.is_open());
}

#[tokio::test]
async fn test_open_twice_is_noop() {
    let (conn, driver) = mock_connection();
    assert_ok!(conn.open().await);
    assert_ok!(conn.open().await);
    assert!(conn.is_open());
    assert!(driver.is_connected().await);
}

#[tokio::test]
async fn test_domain_lifecycle() {
    let (conn, driver) = mock_connection();
    conn.open().await.unwrap();

    let first = conn.create_domain(&DomainSpec::new("first")).await.unwrap();
    let second = conn.create_domain(&DomainSpec::new("second")).await.unwrap();

    let listed = conn.list_domains().await.unwrap();
    assert_eq!(listed, vec![first.clone(), second.clone()]);
    assert_eq!(conn.find_domain("second").await.unwrap(), Some(second.clone()));
    assert_eq!(conn.find_domain("third").await.unwrap(), None);

    conn.destroy_domain(&first).await.unwrap();
    assert_eq!(conn.list_domains().await.unwrap(), vec![second]);
    assert_eq!(driver.destroyed().await, vec![first.id()]);

    let err = conn.destroy_domain(&first).await.unwrap_err();
    assert!(matches!(err, HvError::DomainNotFound(_)));
}

#[tokio::test]
async fn test_list_domains_is_restartable() {
    let (conn, driver) = mock_connection();
    conn.open().await.unwrap();
    assert!(conn.list_domains().await.unwrap().is_empty());

    let outside = driver.insert_domain("outside").await;
    assert_eq!(conn.list_domains().await.unwrap(), vec![outside]);
}

#[tokio::test]
async fn test_create_failure_propagates() {
    let (conn, driver) = mock_connection();
    conn.open().await.unwrap();
    driver.set_fail_create(true);

    let err = conn.create_domain(&DomainSpec::new("box")).await.unwrap_err();
    assert!(matches!(err, HvError::Create(_)));
    assert!(conn.list_domains().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_console_stream_reaches_domain() {
    let (conn, driver) = mock_connection();
    conn.open().await.unwrap();
    let domain = conn.create_domain(&DomainSpec::new("box")).await.unwrap();

    let mut console = conn
        .open_console(&domain, ConsoleTarget::Primary)
        .await
        .unwrap();
    let mut remote = driver.take_remote(domain.id()).await.unwrap();

    remote.write_all(b"login: ").await.unwrap();
    let mut buf = [0u8; 7];
    console.reader.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"login: ");

    console.writer.write_all(b"root\n").await.unwrap();
    let mut buf = [0u8; 5];
    remote.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"root\n");

    drop(remote);
    let mut rest = Vec::new();
    console.reader.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (conn, driver) = mock_connection();
    conn.open().await.unwrap();
    conn.create_domain(&DomainSpec::new("box")).await.unwrap();

    conn.close().await;
    conn.close().await;
    assert!(!conn.is_open());
    assert!(!driver.is_connected().await);
    assert!(matches!(conn.list_domains().await, Err(HvError::NotConnected)));

    assert_ok!(conn.open().await);
    assert!(assert_ok!(conn.list_domains().await).is_empty());
}
