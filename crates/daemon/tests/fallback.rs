//! Fallback installation on a real filesystem.

mod common;

use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;

use certkeeper_common::{AlertSeverity, CertError};
use certkeeper_config::with_suffix;
use certkeeper_daemon::cert_info::read_expiry;
use certkeeper_daemon::FallbackController;

use common::{write_pair, MockSettings, RecordingAlerts, RecordingObserver};

fn controller(
    dir: &TempDir,
    identifier: &str,
) -> (FallbackController, Arc<RecordingAlerts>, Arc<RecordingObserver>) {
    let settings = Arc::new(MockSettings::new(identifier, dir.path().join("panel")));
    let alerts = Arc::new(RecordingAlerts::default());
    let observer = Arc::new(RecordingObserver::default());
    let controller =
        FallbackController::new(settings, alerts.clone()).with_observer(observer.clone());
    (controller, alerts, observer)
}

fn backups_in(dir: &TempDir) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".backup."))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_trigger_installs_pair_and_backs_up_previous() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("panel");
    write_pair(&base, "panel.example.com", 1);
    let (controller, alerts, observer) = controller(&dir, "panel.example.com");

    let record = controller.trigger_fallback().await.unwrap();

    assert_eq!(record.identifier, "panel.example.com");
    assert_eq!(record.path, with_suffix(&base, "crt"));
    assert!(controller.is_degraded());

    let expiry = read_expiry(&record.path).unwrap();
    assert_eq!(expiry, record.expiry);
    assert_eq!((expiry - Utc::now()).num_days(), 29);

    let backups = backups_in(&dir);
    assert_eq!(backups.len(), 2, "{backups:?}");
    assert!(backups.iter().any(|b| b.starts_with("panel.crt.backup.")));
    assert!(backups.iter().any(|b| b.starts_with("panel.key.backup.")));

    assert_eq!(alerts.titles(), vec!["Fallback Certificate Activated".to_string()]);
    assert_eq!(alerts.count(AlertSeverity::Critical), 1);
    assert_eq!(observer.count(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_private_key_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let (controller, _, _) = controller(&dir, "203.0.113.7");
    controller.trigger_fallback().await.unwrap();

    let key_mode = std::fs::metadata(dir.path().join("panel.key"))
        .unwrap()
        .permissions()
        .mode();
    let cert_mode = std::fs::metadata(dir.path().join("panel.crt"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(key_mode & 0o777, 0o600);
    assert_eq!(cert_mode & 0o777, 0o644);
}

#[tokio::test]
async fn test_first_install_has_nothing_to_back_up() {
    let dir = TempDir::new().unwrap();
    let (controller, _, _) = controller(&dir, "203.0.113.7");

    controller.trigger_fallback().await.unwrap();

    assert!(backups_in(&dir).is_empty());
    assert!(dir.path().join("panel.crt").exists());
    assert!(dir.path().join("panel.key").exists());
}

#[tokio::test]
async fn test_failed_certificate_write_keeps_previous_key() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("panel");
    let (cert, key) = write_pair(&base, "203.0.113.7", 2);
    let original_key = std::fs::read(&key).unwrap();

    // The certificate path cannot be replaced
    std::fs::remove_file(&cert).unwrap();
    std::fs::create_dir_all(cert.join("blocker")).unwrap();

    let (controller, alerts, observer) = controller(&dir, "203.0.113.7");
    let err = controller.trigger_fallback().await.unwrap_err();

    assert!(matches!(err, CertError::Io(_)), "{err}");
    assert_eq!(std::fs::read(&key).unwrap(), original_key);
    assert!(!with_suffix(&key, "tmp").exists());
    assert!(!with_suffix(&cert, "tmp").exists());
    assert!(!controller.is_degraded());
    assert!(alerts.sent.lock().is_empty());
    assert_eq!(observer.count(), 0);
}

#[tokio::test]
async fn test_empty_identifier_is_refused() {
    let dir = TempDir::new().unwrap();
    let (controller, alerts, _) = controller(&dir, "");

    let err = controller.trigger_fallback().await.unwrap_err();

    assert!(matches!(err, CertError::Settings(_)));
    assert!(!controller.is_degraded());
    assert!(alerts.sent.lock().is_empty());
}

#[tokio::test]
async fn test_failure_near_expiry_escalates() {
    let dir = TempDir::new().unwrap();
    // Already expired
    write_pair(&dir.path().join("panel"), "203.0.113.7", 0);
    let (controller, alerts, _) = controller(&dir, "203.0.113.7");

    controller
        .on_renewal_failed(&CertError::CaRefused("rate limited".into()), 3)
        .await;

    assert_eq!(controller.consecutive_failures(), 1);
    let sent = alerts.sent.lock();
    assert_eq!(sent.len(), 1);
    let (title, message, severity) = &sent[0];
    assert_eq!(title, "Certificate Expiring");
    assert_eq!(*severity, AlertSeverity::Critical);
    assert!(message.contains("attempt 3"), "{message}");
    assert!(message.contains("rate limited"), "{message}");
    assert!(message.contains("Last successful renewal: never"), "{message}");
}

#[tokio::test]
async fn test_failure_with_time_left_is_quiet() {
    let dir = TempDir::new().unwrap();
    write_pair(&dir.path().join("panel"), "203.0.113.7", 5);
    let (controller, alerts, _) = controller(&dir, "203.0.113.7");

    controller
        .on_renewal_failed(&CertError::CaTimeout(std::time::Duration::from_secs(300)), 1)
        .await;
    controller
        .on_renewal_failed(&CertError::CaRefused("rate limited".into()), 2)
        .await;

    assert_eq!(controller.consecutive_failures(), 2);
    assert!(alerts.sent.lock().is_empty());
}

#[tokio::test]
async fn test_missing_certificate_counts_as_expired() {
    let dir = TempDir::new().unwrap();
    let (controller, alerts, _) = controller(&dir, "203.0.113.7");

    let record = controller.current_record().unwrap();
    assert!(record.expiry <= Utc::now());

    controller
        .on_renewal_failed(&CertError::CaRefused("rate limited".into()), 1)
        .await;
    assert_eq!(alerts.count(AlertSeverity::Critical), 1);
}

#[tokio::test]
async fn test_record_success_leaves_fallback_mode() {
    let dir = TempDir::new().unwrap();
    let (controller, _, _) = controller(&dir, "203.0.113.7");
    controller
        .on_renewal_failed(&CertError::CaRefused("rate limited".into()), 1)
        .await;
    controller.trigger_fallback().await.unwrap();
    assert!(controller.is_degraded());

    controller.record_success();

    assert!(!controller.is_degraded());
    assert_eq!(controller.consecutive_failures(), 0);
    assert!(controller.last_success().is_some());
}
