//! Integration tests for the mapping store and code generator, driven
//! against an in-memory SQLite database with the real migrations applied.

use std::str::FromStr;

use chrono::{Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use shortly::{
    analytics::VisitEvent,
    cache::LinkCache,
    codegen, db,
    error::Error,
    models::{Device, NewLink},
    validate,
};

async fn test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
    // A single connection keeps the in-memory database alive and shared.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn new_link(target: &str, custom: Option<&str>) -> NewLink {
    NewLink {
        target_url: target.to_owned(),
        custom_code: custom.map(str::to_owned),
        title: None,
        creator: None,
        expires_at: None,
    }
}

// ── Creation + resolution ──────────────────────────────────────────────────

#[tokio::test]
async fn generated_code_round_trips() {
    let pool = test_pool().await;

    let link = codegen::create_short_link(&pool, new_link("https://example.com/a", None), 6)
        .await
        .unwrap();

    assert_eq!(link.short_code.len(), 6);
    assert!(link.short_code.chars().all(|c| c.is_ascii_alphanumeric()));

    let resolved = db::get_link_by_code(&pool, &link.short_code)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.target_url, "https://example.com/a");
}

#[tokio::test]
async fn custom_code_round_trips_and_conflicts() {
    let pool = test_pool().await;

    let link = codegen::create_short_link(
        &pool,
        new_link("https://example.com/promo", Some("promo1")),
        6,
    )
    .await
    .unwrap();
    assert_eq!(link.short_code, "promo1");

    let second = codegen::create_short_link(
        &pool,
        new_link("https://example.com/other", Some("promo1")),
        6,
    )
    .await;
    assert!(matches!(second, Err(Error::CodeConflict(code)) if code == "promo1"));

    // The losing call must not have clobbered the original mapping.
    let resolved = db::get_link_by_code(&pool, "promo1").await.unwrap().unwrap();
    assert_eq!(resolved.target_url, "https://example.com/promo");
}

#[tokio::test]
async fn malformed_custom_code_is_rejected() {
    let pool = test_pool().await;

    for bad in ["ab", "has space", "with-hyphen", &"x".repeat(33)] {
        let result =
            codegen::create_short_link(&pool, new_link("https://example.com", Some(bad)), 6).await;
        assert!(matches!(result, Err(Error::InvalidCode(_))), "{bad:?}");
    }
    assert_eq!(db::count_links(&pool).await.unwrap(), 0);
}

#[tokio::test]
async fn concurrent_custom_creations_have_one_winner() {
    let pool = test_pool().await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            codegen::create_short_link(
                &pool,
                new_link(&format!("https://example.com/{i}"), Some("contested")),
                6,
            )
            .await
        }));
    }

    let mut successes = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => successes += 1,
            Err(Error::CodeConflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(db::count_links(&pool).await.unwrap(), 1);
}

#[tokio::test]
async fn distinct_generated_codes_never_collide() {
    let pool = test_pool().await;

    for i in 0..20 {
        codegen::create_short_link(&pool, new_link(&format!("https://example.com/{i}"), None), 6)
            .await
            .unwrap();
    }
    assert_eq!(db::count_links(&pool).await.unwrap(), 20);
}

#[tokio::test]
async fn invalid_target_url_means_no_store_mutation() {
    let pool = test_pool().await;

    // The handler validates before touching the store; mirror that order.
    let validation = validate::target_url("not-a-url");
    assert!(matches!(validation, Err(Error::InvalidUrl(_))));

    assert_eq!(db::count_links(&pool).await.unwrap(), 0);
}

#[tokio::test]
async fn unknown_code_resolves_to_nothing() {
    let pool = test_pool().await;
    assert!(db::get_link_by_code(&pool, "missing").await.unwrap().is_none());
}

// ── Expiry ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn expired_links_are_flagged_but_kept() {
    let pool = test_pool().await;
    let now = Utc::now().naive_utc();

    let mut new = new_link("https://example.com/old", Some("bygone"));
    new.expires_at = Some(now - Duration::hours(1));
    codegen::create_short_link(&pool, new, 6).await.unwrap();

    let link = db::get_link_by_code(&pool, "bygone").await.unwrap().unwrap();
    assert!(link.is_expired(now));

    // Expiry hides the link from resolution; it does not delete the row.
    assert_eq!(db::count_links(&pool).await.unwrap(), 1);
}

#[tokio::test]
async fn warm_cache_skips_expired_links() {
    let pool = test_pool().await;
    let now = Utc::now().naive_utc();

    codegen::create_short_link(&pool, new_link("https://example.com/live", Some("alive")), 6)
        .await
        .unwrap();
    let mut gone = new_link("https://example.com/gone", Some("buried"));
    gone.expires_at = Some(now - Duration::hours(1));
    codegen::create_short_link(&pool, gone, 6).await.unwrap();

    let cache = LinkCache::new();
    db::warm_cache(&pool, &cache).await.unwrap();

    assert!(cache.get("alive").is_some());
    assert!(cache.get("buried").is_none());
}

// ── Mutation ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn title_is_the_only_editable_field() {
    let pool = test_pool().await;

    codegen::create_short_link(&pool, new_link("https://example.com", Some("titled")), 6)
        .await
        .unwrap();

    let updated = db::update_title(&pool, "titled", Some("My launch post"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.title.as_deref(), Some("My launch post"));
    assert_eq!(updated.target_url, "https://example.com");

    let cleared = db::update_title(&pool, "titled", None).await.unwrap().unwrap();
    assert_eq!(cleared.title, None);

    assert!(db::update_title(&pool, "missing", Some("x")).await.unwrap().is_none());
}

#[tokio::test]
async fn deleting_frees_the_code() {
    let pool = test_pool().await;

    codegen::create_short_link(&pool, new_link("https://example.com/1", Some("reuse1")), 6)
        .await
        .unwrap();

    assert!(db::delete_link(&pool, "reuse1").await.unwrap());
    assert!(db::get_link_by_code(&pool, "reuse1").await.unwrap().is_none());
    assert!(!db::delete_link(&pool, "reuse1").await.unwrap());

    // The code is reusable once the row is gone.
    codegen::create_short_link(&pool, new_link("https://example.com/2", Some("reuse1")), 6)
        .await
        .unwrap();
}

// ── Listing ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn listing_joins_click_counts() {
    let pool = test_pool().await;

    codegen::create_short_link(&pool, new_link("https://example.com/a", Some("first1")), 6)
        .await
        .unwrap();
    codegen::create_short_link(&pool, new_link("https://example.com/b", Some("second")), 6)
        .await
        .unwrap();

    let events: Vec<VisitEvent> = (0..3)
        .map(|fp| VisitEvent {
            code: "first1".into(),
            visited_at: Utc::now().naive_utc(),
            country: None,
            device: Device::Desktop,
            referrer: None,
            fingerprint: fp,
            client_ip: None,
        })
        .collect();
    db::insert_visits(&pool, &events).await.unwrap();

    let listed = db::list_links_with_stats(&pool).await.unwrap();
    assert_eq!(listed.len(), 2);

    let first = listed.iter().find(|l| l.short_code == "first1").unwrap();
    let second = listed.iter().find(|l| l.short_code == "second").unwrap();
    assert_eq!(first.click_count, 3);
    assert_eq!(second.click_count, 0);
}
