//! Accounts, opaque credentials, proxy binding, API keys.

mod common;

use common::ACCOUNT;
use funding_flow::db::accounts::AccountStore;
use funding_flow::model::{Account, ProxyAssignment, ProxyStatus};
use funding_flow::venues::paper::PaperVenue;
use funding_flow::venues::rest::{ApiCredentials, RestVenue};
use funding_flow::venues::VenueClient;

fn store(h: &common::Harness) -> AccountStore {
    AccountStore::new(h.db.clone())
}

#[tokio::test]
async fn credentials_round_trip_through_opaque_ciphertext() {
    let h = common::harness().await;
    let accounts = store(&h);
    accounts
        .upsert(&Account {
            id: ACCOUNT.into(),
            name: "primary".into(),
            user: None,
            active: true,
            is_admin: false,
        })
        .await
        .unwrap();

    let creds = ApiCredentials {
        api_key: "key-123".into(),
        api_secret: "secret-456".into(),
    };
    accounts
        .store_credentials(ACCOUNT, "hyperion", &creds, "master-passphrase")
        .await
        .unwrap();

    let loaded = accounts
        .load_credentials(ACCOUNT, "hyperion", "master-passphrase")
        .await
        .unwrap();
    assert_eq!(loaded.api_key, "key-123");
    assert_eq!(loaded.api_secret, "secret-456");

    // The stored blob is opaque: no plaintext leaks into the row.
    let ciphertext: String = {
        let conn = h.db.lock().await;
        conn.query_row(
            "SELECT ciphertext FROM exchange_credentials WHERE account = ?1 AND venue = 'hyperion'",
            [ACCOUNT],
            |row| row.get(0),
        )
        .unwrap()
    };
    assert!(!ciphertext.contains("key-123"));
    assert!(!ciphertext.contains("secret-456"));

    // The wrong master key cannot decrypt.
    assert!(
        accounts
            .load_credentials(ACCOUNT, "hyperion", "wrong-passphrase")
            .await
            .is_err()
    );
}

#[tokio::test]
async fn highest_priority_active_proxy_wins() {
    let h = common::harness().await;
    let accounts = store(&h);
    accounts
        .upsert(&Account {
            id: ACCOUNT.into(),
            name: "primary".into(),
            user: None,
            active: true,
            is_admin: false,
        })
        .await
        .unwrap();

    for (url, priority, status) in [
        ("http://proxy-a:8080", 1, ProxyStatus::Active),
        ("http://proxy-b:8080", 5, ProxyStatus::Active),
        ("http://proxy-c:8080", 9, ProxyStatus::Burned),
    ] {
        accounts
            .assign_proxy(&ProxyAssignment {
                account: ACCOUNT.into(),
                proxy_url: url.into(),
                priority,
                status,
            })
            .await
            .unwrap();
    }

    let picked = accounts.active_proxy(ACCOUNT).await.unwrap().unwrap();
    assert_eq!(picked.proxy_url, "http://proxy-b:8080");
}

#[tokio::test]
async fn api_keys_verify_by_hash_only() {
    let h = common::harness().await;
    let accounts = store(&h);

    accounts.set_api_key("user-1", "s3cret-key").await.unwrap();
    assert_eq!(
        accounts.verify_api_key("s3cret-key").await.unwrap().as_deref(),
        Some("user-1")
    );
    assert_eq!(accounts.verify_api_key("nope").await.unwrap(), None);

    let stored: String = {
        let conn = h.db.lock().await;
        conn.query_row("SELECT key_hash FROM api_keys WHERE user = 'user-1'", [], |row| {
            row.get(0)
        })
        .unwrap()
    };
    assert_ne!(stored, "s3cret-key");
    assert_eq!(stored.len(), 64);
}

#[test]
fn non_admin_without_proxy_cannot_build_a_client() {
    let meta = common::venue_meta("hyperion", 8.0);
    let creds = ApiCredentials {
        api_key: "k".into(),
        api_secret: "s".into(),
    };
    let result = RestVenue::connect(
        meta.clone(),
        "https://api.example.test",
        "wss://ws.example.test",
        creds.clone(),
        None,
        false,
        10.0,
    );
    assert!(result.is_err());

    // Admin accounts may run without a proxy.
    let admin = RestVenue::connect(
        meta,
        "https://api.example.test",
        "wss://ws.example.test",
        creds,
        None,
        true,
        10.0,
    );
    assert!(admin.is_ok());
}

#[tokio::test]
async fn paper_venue_reports_its_identity() {
    let venue = PaperVenue::new(common::venue_meta("hyperion", 1.0));
    assert_eq!(venue.venue_id(), "hyperion");
    assert_eq!(venue.meta().funding_interval_hours, 1.0);
}
