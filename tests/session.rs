mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{SimulatedLedger, ACCOUNT_0};
use ledger_eth_provider::commands::ActionOutput;
use ledger_eth_provider::types::DiscoveredDevice;
use ledger_eth_provider::{
    Bip32Path, DeviceAction, DeviceActionResult, DeviceFilter, DeviceModel, DeviceSession,
    LedgerError, SessionState, Signer,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn two_devices() -> SimulatedLedger {
    SimulatedLedger::with_devices(vec![
        DiscoveredDevice {
            device_id: "usb-1".into(),
            model: DeviceModel::NanoSPlus,
        },
        DiscoveredDevice {
            device_id: "usb-2".into(),
            model: DeviceModel::NanoX,
        },
    ])
}

fn get_address(index: u32) -> DeviceAction {
    DeviceAction::GetAddress {
        path: Bip32Path::ethereum(index),
        confirm: false,
    }
}

#[tokio::test]
async fn filter_selects_device() {
    let ledger = two_devices();
    let mut session = DeviceSession::new(ledger.boxed());

    let filter = DeviceFilter {
        model_id: Some("nanox".into()),
        ..Default::default()
    };
    let handle = session.connect(&filter, TIMEOUT).await.unwrap();
    assert_eq!(handle.device_id(), "usb-2");
    assert_eq!(handle.model_id(), "nanoX");
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test]
async fn unmatched_filter_falls_back_to_first_device() {
    let ledger = two_devices();
    let mut session = DeviceSession::new(ledger.boxed());

    let filter = DeviceFilter {
        device_id: Some("usb-9".into()),
        ..Default::default()
    };
    let handle = session.connect(&filter, TIMEOUT).await.unwrap();
    assert_eq!(handle.device_id(), "usb-1");
}

#[tokio::test]
async fn no_devices() {
    let ledger = SimulatedLedger::with_devices(Vec::new());
    let mut session = DeviceSession::new(ledger.boxed());

    let err = session
        .connect(&DeviceFilter::default(), TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::DeviceNotConnected(ref m) if m == "no Ledger devices found"));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn reconnect_issues_new_session_id() {
    let ledger = SimulatedLedger::default();
    let mut session = DeviceSession::new(ledger.boxed());

    let first = session.connect(&DeviceFilter::default(), TIMEOUT).await.unwrap();
    let second = session.connect(&DeviceFilter::default(), TIMEOUT).await.unwrap();
    assert_ne!(first.session_id, second.session_id);
    assert_eq!(ledger.connects(), 2);
    assert_eq!(ledger.disconnects(), 1);
}

#[tokio::test]
async fn execute_without_session() {
    let ledger = SimulatedLedger::default();
    let session = DeviceSession::new(ledger.boxed());

    let err = session.execute(get_address(0)).await.unwrap_err();
    assert!(matches!(err, LedgerError::DeviceNotConnected(_)));
    assert!(ledger.sent().is_empty());
}

#[tokio::test]
async fn device_errors_are_failed_results() {
    let ledger = SimulatedLedger::default();
    let mut session = DeviceSession::new(ledger.boxed());
    session.connect(&DeviceFilter::default(), TIMEOUT).await.unwrap();

    ledger.set_reject(true);
    match session.execute(get_address(0)).await.unwrap() {
        DeviceActionResult::Failed(failure) => assert!(failure.is_user_rejection()),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn permission_error_is_not_a_rejection() {
    let ledger = SimulatedLedger::default();
    let mut signer = Signer::new(DeviceSession::new(ledger.boxed()));
    signer.connect(&DeviceFilter::default(), TIMEOUT).await.unwrap();

    ledger.set_io_failure(true);
    let err = signer
        .sign_message(&Bip32Path::ethereum(0), b"hello")
        .await
        .unwrap_err();
    assert!(
        matches!(err, LedgerError::CommandFailed(ref m) if m.contains("IO error")),
        "{err:?}"
    );

    let err = signer
        .get_address(&Bip32Path::ethereum(0), false)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::CommandFailed(_)), "{err:?}");
}

#[tokio::test]
async fn concurrent_actions_are_serialized() {
    let ledger = SimulatedLedger::default();
    let mut session = DeviceSession::new(ledger.boxed());
    session.connect(&DeviceFilter::default(), TIMEOUT).await.unwrap();
    let session = Arc::new(session);

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let session = session.clone();
            tokio::spawn(async move { session.execute(get_address(i)).await })
        })
        .collect();

    for (i, task) in tasks.into_iter().enumerate() {
        match task.await.unwrap().unwrap() {
            DeviceActionResult::Completed(ActionOutput::Address(info)) => {
                assert_eq!(info.address, ledger.address(i as u32));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(ledger.sent().len(), 8);
}

#[tokio::test]
async fn long_messages_do_not_interleave() {
    let ledger = SimulatedLedger::default();
    let mut signer = Signer::new(DeviceSession::new(ledger.boxed()));
    signer.connect(&DeviceFilter::default(), TIMEOUT).await.unwrap();
    let signer = Arc::new(signer);
    let path = Bip32Path::ethereum(0);

    let a = {
        let signer = signer.clone();
        let path = path.clone();
        tokio::spawn(async move { signer.sign_message(&path, &[b'a'; 700]).await })
    };
    let b = {
        let signer = signer.clone();
        let path = path.clone();
        tokio::spawn(async move { signer.sign_message(&path, &[b'b'; 700]).await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let signed = ledger.signed();
    assert_eq!(signed.len(), 2);
    for (_, body) in signed {
        let message = &body[4..];
        assert_eq!(message.len(), 700);
        assert!(message.iter().all(|&c| c == message[0]));
    }
}

#[tokio::test]
async fn signer_reads_app_configuration() {
    let ledger = SimulatedLedger::default();
    let mut signer = Signer::new(DeviceSession::new(ledger.boxed()));
    signer.connect(&DeviceFilter::default(), TIMEOUT).await.unwrap();

    let config = signer.app_configuration().await.unwrap();
    assert_eq!((config.major, config.minor, config.patch), (1, 10, 4));
    assert!(config.arbitrary_data_enabled());

    let info = signer.get_address(&Bip32Path::ethereum(0), false).await.unwrap();
    assert_eq!(info.address.to_checksum(None), ACCOUNT_0);
    assert_eq!(info.public_key.len(), 65);
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let ledger = SimulatedLedger::default();
    let mut session = DeviceSession::new(ledger.boxed());
    session.disconnect().await;

    session.connect(&DeviceFilter::default(), TIMEOUT).await.unwrap();
    session.disconnect().await;
    session.disconnect().await;

    assert_eq!(ledger.disconnects(), 1);
    assert!(!session.is_connected());
    assert!(session.session_id().is_none());
}
