use super::*;
use super::conflict::today;
use crate::identity::FixedIdentity;
use crate::limits::*;
use crate::payment::{SandboxGateway, DECLINED_TOKEN};

use chrono::Days;

// ── Helpers ──────────────────────────────────────────────

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("innkeep_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str, gateway: Arc<SandboxGateway>) -> Engine {
    Engine::new(test_wal_path(name), gateway, Duration::from_secs(5)).unwrap()
}

/// `n` days from today, in caller format.
fn in_days(n: u64) -> String {
    format_day(today().checked_add_days(Days::new(n)).unwrap())
}

fn address(country: &str, city: &str) -> Address {
    Address {
        country: country.into(),
        city: city.into(),
        street: "Main".into(),
        street_number: "1".into(),
    }
}

async fn seed_resort(engine: &Engine, name: &str, country: &str, city: &str) {
    engine
        .create_resort(name.into(), "owner@example.com".into(), address(country, city))
        .await
        .unwrap();
}

fn room_spec(resort: &str, number: RoomNumber, capacity: u32, price: Minor) -> RoomSpec {
    RoomSpec {
        key: RoomKey::new(resort, number),
        price,
        currency: "EUR".into(),
        capacity,
        beds: Beds { single: 0, double: 1, king_size: 0 },
        amenities: vec![RoomAmenity::Tv, RoomAmenity::Balcony],
    }
}

async fn seed_room(engine: &Engine, resort: &str, number: RoomNumber, capacity: u32) {
    engine
        .create_room(room_spec(resort, number, capacity, 10_000))
        .await
        .unwrap();
}

fn request(resort: &str, room: RoomNumber, start: &str, end: &str) -> ReservationRequest {
    ReservationRequest {
        resort: resort.into(),
        room,
        start: start.into(),
        end: end.into(),
        payment_token: "tok_visa".into(),
    }
}

fn criteria(location: &str, residents: u32, start: &str, end: &str) -> SearchCriteria {
    SearchCriteria {
        location: location.into(),
        residents,
        start: start.into(),
        end: end.into(),
        page: None,
        page_size: None,
        photos: None,
    }
}

fn guest() -> FixedIdentity {
    FixedIdentity::named("guest@example.com")
}

// ── Catalogue ────────────────────────────────────────────

#[tokio::test]
async fn engine_create_resort_and_room() {
    let engine = new_engine("create.wal", Arc::new(SandboxGateway::new()));
    seed_resort(&engine, "Amber", "Poland", "Gdansk").await;
    seed_room(&engine, "Amber", 101, 2).await;

    let resort = engine.find_resort_by_name("Amber").unwrap();
    assert_eq!(resort.address.city, "Gdansk");
    let rooms = engine.list_rooms();
    assert_eq!(rooms.len(), 1);
    let guard = rooms[0].1.state.read().await;
    assert_eq!(guard.room.address, resort.address);
    assert_eq!(guard.room.capacity, 2);
}

#[tokio::test]
async fn engine_duplicates_rejected() {
    let engine = new_engine("duplicates.wal", Arc::new(SandboxGateway::new()));
    seed_resort(&engine, "Amber", "Poland", "Gdansk").await;
    let again = engine
        .create_resort("Amber".into(), "other@example.com".into(), address("Poland", "Sopot"))
        .await;
    assert!(matches!(again, Err(EngineError::ResortAlreadyExists(_))));

    seed_room(&engine, "Amber", 101, 2).await;
    let again = engine.create_room(room_spec("Amber", 101, 3, 5_000)).await;
    assert!(matches!(again, Err(EngineError::RoomAlreadyExists(_))));
}

#[tokio::test]
async fn engine_room_requires_resort() {
    let engine = new_engine("room_requires_resort.wal", Arc::new(SandboxGateway::new()));
    let result = engine.create_room(room_spec("Nowhere", 1, 2, 5_000)).await;
    assert!(matches!(result, Err(EngineError::ResortNotFound(_))));
}

#[tokio::test]
async fn engine_list_rooms_in_inventory_order() {
    let engine = new_engine("list_order.wal", Arc::new(SandboxGateway::new()));
    seed_resort(&engine, "Baltic", "Poland", "Sopot").await;
    seed_resort(&engine, "Amber", "Poland", "Gdansk").await;
    seed_room(&engine, "Baltic", 2, 2).await;
    seed_room(&engine, "Amber", 10, 2).await;
    seed_room(&engine, "Baltic", 1, 2).await;
    seed_room(&engine, "Amber", 3, 2).await;

    let keys: Vec<String> = engine.list_rooms().into_iter().map(|(k, _)| k.to_string()).collect();
    assert_eq!(keys, vec!["Amber#3", "Amber#10", "Baltic#1", "Baltic#2"]);
}

#[tokio::test]
async fn engine_photo_limit() {
    let engine = new_engine("photo_limit.wal", Arc::new(SandboxGateway::new()));
    seed_resort(&engine, "Amber", "Poland", "Gdansk").await;
    seed_room(&engine, "Amber", 1, 2).await;
    for position in 0..MAX_PHOTOS_PER_ROOM as u32 {
        engine
            .add_photo("Amber", 1, Photo { position, url: format!("https://img/{position}") })
            .await
            .unwrap();
    }
    let over = engine
        .add_photo("Amber", 1, Photo { position: 999, url: "https://img/x".into() })
        .await;
    assert!(matches!(over, Err(EngineError::LimitExceeded(_))));
    // replacing an existing position is fine
    engine
        .add_photo("Amber", 1, Photo { position: 0, url: "https://img/new".into() })
        .await
        .unwrap();
}

#[tokio::test]
async fn engine_delete_room_blocked_by_unrealized_reservation() {
    let engine = new_engine("delete_blocked.wal", Arc::new(SandboxGateway::new()));
    seed_resort(&engine, "Amber", "Poland", "Gdansk").await;
    seed_room(&engine, "Amber", 1, 2).await;
    seed_room(&engine, "Amber", 2, 2).await;
    engine
        .commit_reservation(&request("Amber", 1, &in_days(3), &in_days(5)), &guest())
        .await
        .unwrap();

    let blocked = engine.delete_room("Amber", 1).await;
    assert!(matches!(blocked, Err(EngineError::HasActiveReservations(_))));

    engine.delete_room("Amber", 2).await.unwrap();
    assert!(engine.get_room(&RoomKey::new("Amber", 2)).is_none());
    let again = engine.delete_room("Amber", 2).await;
    assert!(matches!(again, Err(EngineError::RoomNotFound(2))));
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn engine_check_availability() {
    let engine = new_engine("check_availability.wal", Arc::new(SandboxGateway::new()));
    seed_resort(&engine, "Amber", "Poland", "Gdansk").await;
    seed_room(&engine, "Amber", 101, 2).await;
    engine
        .commit_reservation(&request("Amber", 101, &in_days(10), &in_days(14)), &guest())
        .await
        .unwrap();

    assert!(!engine.check_availability("Amber", 101, &in_days(12), &in_days(16)).await.unwrap());
    assert!(engine.check_availability("Amber", 101, &in_days(14), &in_days(16)).await.unwrap());
    // past ranges may be queried
    assert!(engine.check_availability("Amber", 101, "01-01-2001", "05-01-2001").await.unwrap());

    assert!(matches!(
        engine.check_availability("Amber", 999, &in_days(1), &in_days(2)).await,
        Err(EngineError::RoomNotFound(999))
    ));
    assert!(matches!(
        engine.check_availability("Nowhere", 101, &in_days(1), &in_days(2)).await,
        Err(EngineError::ResortNotFound(_))
    ));
    assert!(matches!(
        engine.check_availability("Amber", 101, "2024-03-01", &in_days(2)).await,
        Err(EngineError::IncorrectFormat(_))
    ));
    assert!(matches!(
        engine.check_availability("Amber", 101, &in_days(2), &in_days(2)).await,
        Err(EngineError::IncorrectRange)
    ));
}

#[tokio::test]
async fn engine_availability_is_idempotent() {
    let engine = new_engine("availability_idempotent.wal", Arc::new(SandboxGateway::new()));
    seed_resort(&engine, "Amber", "Poland", "Gdansk").await;
    seed_room(&engine, "Amber", 1, 2).await;
    let first = engine.check_availability("Amber", 1, &in_days(1), &in_days(3)).await.unwrap();
    let second = engine.check_availability("Amber", 1, &in_days(1), &in_days(3)).await.unwrap();
    assert_eq!(first, second);
}

// ── Commit workflow ──────────────────────────────────────

#[tokio::test]
async fn engine_commit_charges_nights_times_price() {
    let gw = Arc::new(SandboxGateway::new());
    let engine = new_engine("commit_charge.wal", gw.clone());
    seed_resort(&engine, "Amber", "Poland", "Gdansk").await;
    engine
        .create_room(room_spec("Amber", 7, 2, 12_050))
        .await
        .unwrap();

    let info = engine
        .commit_reservation(&request("Amber", 7, &in_days(5), &in_days(9)), &guest())
        .await
        .unwrap();
    assert_eq!(info.amount, 4 * 12_050);
    assert_eq!(info.currency, "EUR");
    assert_eq!(info.user, "guest@example.com");
    assert_eq!(gw.captured_total(), 4 * 12_050);

    let listed = engine.get_reservations("Amber", 7).await.unwrap();
    assert_eq!(listed, vec![info]);
}

#[tokio::test]
async fn engine_overlapping_commit_rejected() {
    let gw = Arc::new(SandboxGateway::new());
    let engine = new_engine("commit_overlap.wal", gw.clone());
    seed_resort(&engine, "Amber", "Poland", "Gdansk").await;
    seed_room(&engine, "Amber", 101, 2).await;

    engine
        .commit_reservation(&request("Amber", 101, &in_days(10), &in_days(14)), &guest())
        .await
        .unwrap();

    let overlapping = engine
        .commit_reservation(&request("Amber", 101, &in_days(12), &in_days(16)), &guest())
        .await;
    assert!(matches!(overlapping, Err(EngineError::UnavailableTimePeriod)));

    let identical = engine
        .commit_reservation(&request("Amber", 101, &in_days(10), &in_days(14)), &guest())
        .await;
    assert!(matches!(identical, Err(EngineError::UnavailableTimePeriod)));

    // touching boundary is fine
    engine
        .commit_reservation(&request("Amber", 101, &in_days(14), &in_days(17)), &guest())
        .await
        .unwrap();

    // the rejected attempts never reached the gateway
    assert_eq!(gw.attempts(), 2);
}

#[tokio::test]
async fn engine_commit_starting_today_rejected() {
    let gw = Arc::new(SandboxGateway::new());
    let engine = new_engine("commit_today.wal", gw.clone());
    seed_resort(&engine, "Amber", "Poland", "Gdansk").await;
    seed_room(&engine, "Amber", 1, 2).await;

    let result = engine
        .commit_reservation(&request("Amber", 1, &in_days(0), &in_days(3)), &guest())
        .await;
    assert!(matches!(result, Err(EngineError::IncorrectRange)));
    let past = engine
        .commit_reservation(&request("Amber", 1, "01-01-2001", "05-01-2001"), &guest())
        .await;
    assert!(matches!(past, Err(EngineError::IncorrectRange)));

    assert_eq!(gw.attempts(), 0);
    assert!(engine.get_reservations("Amber", 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn engine_commit_validation_order() {
    let gw = Arc::new(SandboxGateway::new());
    let engine = new_engine("commit_validation.wal", gw.clone());
    seed_resort(&engine, "Amber", "Poland", "Gdansk").await;
    seed_room(&engine, "Amber", 1, 2).await;

    let bad_format = engine
        .commit_reservation(&request("Nowhere", 1, "1-1-2030", &in_days(3)), &guest())
        .await;
    assert!(matches!(bad_format, Err(EngineError::IncorrectFormat(_))));

    let reversed = engine
        .commit_reservation(&request("Amber", 1, &in_days(5), &in_days(3)), &guest())
        .await;
    assert!(matches!(reversed, Err(EngineError::IncorrectRange)));

    let no_resort = engine
        .commit_reservation(&request("Nowhere", 1, &in_days(3), &in_days(5)), &guest())
        .await;
    assert!(matches!(no_resort, Err(EngineError::ResortNotFound(_))));

    let no_room = engine
        .commit_reservation(&request("Amber", 42, &in_days(3), &in_days(5)), &guest())
        .await;
    assert!(matches!(no_room, Err(EngineError::RoomNotFound(42))));

    let too_long = engine
        .commit_reservation(
            &request("Amber", 1, &in_days(3), &in_days(3 + MAX_STAY_NIGHTS as u64 + 1)),
            &guest(),
        )
        .await;
    assert!(matches!(too_long, Err(EngineError::LimitExceeded(_))));

    assert_eq!(gw.attempts(), 0);
}

#[tokio::test]
async fn engine_commit_requires_identity() {
    let gw = Arc::new(SandboxGateway::new());
    let engine = new_engine("commit_identity.wal", gw.clone());
    seed_resort(&engine, "Amber", "Poland", "Gdansk").await;
    seed_room(&engine, "Amber", 1, 2).await;

    let anonymous = crate::identity::SessionIdentity::new(None);
    let result = engine
        .commit_reservation(&request("Amber", 1, &in_days(3), &in_days(5)), &anonymous)
        .await;
    assert!(matches!(result, Err(EngineError::Unauthenticated)));
    assert_eq!(gw.attempts(), 0);
}

#[tokio::test]
async fn engine_declined_payment_stores_nothing() {
    let gw = Arc::new(SandboxGateway::new());
    let engine = new_engine("commit_declined.wal", gw.clone());
    seed_resort(&engine, "Amber", "Poland", "Gdansk").await;
    seed_room(&engine, "Amber", 1, 2).await;

    let mut req = request("Amber", 1, &in_days(3), &in_days(5));
    req.payment_token = DECLINED_TOKEN.into();
    let result = engine.commit_reservation(&req, &guest()).await;
    assert!(matches!(result, Err(EngineError::PaymentFailed(_))));
    assert!(engine.get_reservations("Amber", 1).await.unwrap().is_empty());
    assert!(engine.check_availability("Amber", 1, &in_days(3), &in_days(5)).await.unwrap());
}

#[tokio::test]
async fn engine_payment_timeout_fails_closed() {
    let gw = Arc::new(SandboxGateway::with_latency(Duration::from_secs(5)));
    let engine = Engine::new(
        test_wal_path("commit_timeout.wal"),
        gw.clone(),
        Duration::from_millis(20),
    )
    .unwrap();
    seed_resort(&engine, "Amber", "Poland", "Gdansk").await;
    seed_room(&engine, "Amber", 1, 2).await;

    let result = engine
        .commit_reservation(&request("Amber", 1, &in_days(3), &in_days(5)), &guest())
        .await;
    assert!(matches!(result, Err(EngineError::PaymentFailed(_))));
    assert_eq!(gw.attempts(), 1);
    assert!(gw.captured().is_empty());
    assert!(engine.get_reservations("Amber", 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn engine_failed_persist_refunds_charge() {
    let gw = Arc::new(SandboxGateway::new());
    let mut engine = new_engine("commit_refund.wal", gw.clone());
    seed_resort(&engine, "Amber", "Poland", "Gdansk").await;
    seed_room(&engine, "Amber", 1, 2).await;

    // Cut the engine off from its WAL writer.
    let (dead_tx, dead_rx) = mpsc::channel(1);
    drop(dead_rx);
    engine.wal_tx = dead_tx;

    let result = engine
        .commit_reservation(&request("Amber", 1, &in_days(3), &in_days(5)), &guest())
        .await;
    assert!(matches!(result, Err(EngineError::WalError(_))));
    assert_eq!(gw.attempts(), 1);
    assert_eq!(gw.refunds(), 1);
    assert_eq!(gw.captured_total(), 0);
    assert!(engine.get_reservations("Amber", 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn engine_concurrent_overlapping_commits_one_wins() {
    // Latency keeps the first commit inside the payment step while the
    // second one arrives.
    let gw = Arc::new(SandboxGateway::with_latency(Duration::from_millis(50)));
    let engine = Arc::new(new_engine("commit_race.wal", gw.clone()));
    seed_resort(&engine, "Amber", "Poland", "Gdansk").await;
    seed_room(&engine, "Amber", 101, 2).await;

    let mut handles = Vec::new();
    for _ in 0..2 {
        let engine = engine.clone();
        let req = request("Amber", 101, &in_days(20), &in_days(25));
        handles.push(tokio::spawn(async move {
            engine.commit_reservation(&req, &guest()).await
        }));
    }
    let mut ok = 0;
    let mut unavailable = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::UnavailableTimePeriod) => unavailable += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((ok, unavailable), (1, 1));
    assert_eq!(gw.attempts(), 1);
    assert_eq!(engine.get_reservations("Amber", 101).await.unwrap().len(), 1);
}

#[tokio::test]
async fn engine_concurrent_commits_on_many_rooms() {
    let engine = Arc::new(new_engine("commit_many.wal", Arc::new(SandboxGateway::new())));
    seed_resort(&engine, "Amber", "Poland", "Gdansk").await;
    for number in 1..=8 {
        seed_room(&engine, "Amber", number, 2).await;
    }

    let mut handles = Vec::new();
    for number in 1..=8u32 {
        // same range four times per room: exactly one per room may win
        for _ in 0..4 {
            let engine = engine.clone();
            let req = request("Amber", number, &in_days(30), &in_days(33));
            handles.push(tokio::spawn(async move {
                engine.commit_reservation(&req, &guest()).await.is_ok()
            }));
        }
    }
    let mut wins = 0;
    for h in handles {
        if h.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 8);
    for number in 1..=8 {
        assert_eq!(engine.get_reservations("Amber", number).await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn engine_reads_not_blocked_by_inflight_payment() {
    let gw = Arc::new(SandboxGateway::with_latency(Duration::from_secs(2)));
    let engine = Arc::new(new_engine("commit_nonblocking.wal", gw.clone()));
    seed_resort(&engine, "Amber", "Poland", "Gdansk").await;
    seed_resort(&engine, "Louvre", "France", "Paris").await;
    seed_room(&engine, "Amber", 1, 2).await;
    seed_room(&engine, "Louvre", 1, 2).await;

    let (start, end) = (in_days(10), in_days(12));
    let commit = {
        let engine = engine.clone();
        let req = request("Amber", 1, &start, &end);
        tokio::spawn(async move { engine.commit_reservation(&req, &guest()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = std::time::Instant::now();
    let page = engine.search(&criteria("Paris", 2, &start, &end)).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(engine.count(&criteria("Gdansk", 2, &start, &end)).await.unwrap(), 1);
    assert!(engine.check_availability("Amber", 1, &start, &end).await.unwrap());
    assert!(engine.get_reservations("Amber", 1).await.unwrap().is_empty());
    seed_room(&engine, "Louvre", 2, 2).await;
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "reads waited {:?} on the payment",
        started.elapsed()
    );

    commit.await.unwrap().unwrap();
    assert!(!engine.check_availability("Amber", 1, &start, &end).await.unwrap());
}

#[tokio::test]
async fn engine_room_deleted_during_payment_refunds() {
    let gw = Arc::new(SandboxGateway::with_latency(Duration::from_millis(300)));
    let engine = Arc::new(new_engine("commit_deleted_midway.wal", gw.clone()));
    seed_resort(&engine, "Amber", "Poland", "Gdansk").await;
    seed_room(&engine, "Amber", 1, 2).await;

    let commit = {
        let engine = engine.clone();
        let req = request("Amber", 1, &in_days(10), &in_days(12));
        tokio::spawn(async move { engine.commit_reservation(&req, &guest()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.delete_room("Amber", 1).await.unwrap();

    let result = commit.await.unwrap();
    assert!(matches!(result, Err(EngineError::RoomNotFound(1))));
    assert_eq!(gw.attempts(), 1);
    assert_eq!(gw.refunds(), 1);
    assert_eq!(gw.captured_total(), 0);
}

// ── Search ───────────────────────────────────────────────

/// Ten Paris rooms: three free with capacity 2, three booked with capacity
/// 2, four with capacity 3. Plus a Lyon room with capacity 2.
async fn seed_paris(engine: &Engine) -> (String, String) {
    seed_resort(engine, "Louvre", "France", "Paris").await;
    seed_resort(engine, "Rhone", "France", "Lyon").await;
    for number in 1..=10 {
        let capacity = if number <= 6 { 2 } else { 3 };
        seed_room(engine, "Louvre", number, capacity).await;
    }
    seed_room(engine, "Rhone", 1, 2).await;

    let (start, end) = (in_days(40), in_days(43));
    for number in 4..=6 {
        engine
            .commit_reservation(&request("Louvre", number, &in_days(41), &in_days(45)), &guest())
            .await
            .unwrap();
    }
    (start, end)
}

#[tokio::test]
async fn engine_search_scenario() {
    let engine = new_engine("search_scenario.wal", Arc::new(SandboxGateway::new()));
    let (start, end) = seed_paris(&engine).await;

    let all = criteria("Paris", 2, &start, &end);
    assert_eq!(engine.count(&all).await.unwrap(), 3);

    let page1 = engine
        .search(&SearchCriteria { page: Some(1), page_size: Some(2), ..all.clone() })
        .await
        .unwrap();
    assert_eq!(page1.total, 3);
    let numbers: Vec<RoomNumber> = page1.rooms.iter().map(|r| r.number).collect();
    assert_eq!(numbers, vec![1, 2]);

    let page2 = engine
        .search(&SearchCriteria { page: Some(2), page_size: Some(2), ..all.clone() })
        .await
        .unwrap();
    let numbers: Vec<RoomNumber> = page2.rooms.iter().map(|r| r.number).collect();
    assert_eq!(numbers, vec![3]);

    let past_end = engine
        .search(&SearchCriteria { page: Some(3), page_size: Some(2), ..all.clone() })
        .await
        .unwrap();
    assert!(past_end.rooms.is_empty());
    assert_eq!(past_end.total, 3);
}

#[tokio::test]
async fn engine_search_pages_concatenate_to_full_result() {
    let engine = new_engine("search_pages.wal", Arc::new(SandboxGateway::new()));
    seed_resort(&engine, "Louvre", "France", "Paris").await;
    for number in 1..=11 {
        seed_room(&engine, "Louvre", number, 2).await;
    }
    let all = criteria("paris", 2, &in_days(1), &in_days(2));
    let full = engine.search(&all).await.unwrap();
    assert_eq!(full.rooms.len(), 11);

    for size in 1..=12u32 {
        let pages = full.total.div_ceil(size as usize) as u32;
        let mut joined = Vec::new();
        for page in 1..=pages {
            let part = engine
                .search(&SearchCriteria { page: Some(page), page_size: Some(size), ..all.clone() })
                .await
                .unwrap();
            joined.extend(part.rooms);
        }
        assert_eq!(joined, full.rooms, "page size {size}");
    }
}

#[tokio::test]
async fn engine_search_no_match() {
    let engine = new_engine("search_no_match.wal", Arc::new(SandboxGateway::new()));
    let (start, end) = seed_paris(&engine).await;

    let nobody = criteria("Berlin", 2, &start, &end);
    assert!(matches!(engine.search(&nobody).await, Err(EngineError::NoMatchingRooms)));
    assert_eq!(engine.count(&nobody).await.unwrap(), 0);

    let too_many = criteria("Paris", 5, &start, &end);
    assert!(matches!(engine.search(&too_many).await, Err(EngineError::NoMatchingRooms)));
}

#[tokio::test]
async fn engine_search_validates_input() {
    let engine = new_engine("search_validation.wal", Arc::new(SandboxGateway::new()));
    seed_paris(&engine).await;

    let bad_format = criteria("Paris", 2, "2030-01-01", "05-01-2030");
    assert!(matches!(engine.search(&bad_format).await, Err(EngineError::IncorrectFormat(_))));
    assert!(matches!(engine.count(&bad_format).await, Err(EngineError::IncorrectFormat(_))));

    let same_day = criteria("Paris", 2, "05-01-2030", "05-01-2030");
    assert!(matches!(engine.search(&same_day).await, Err(EngineError::IncorrectRange)));

    let zero_page = SearchCriteria {
        page: Some(0),
        page_size: Some(2),
        ..criteria("Paris", 2, "01-01-2030", "05-01-2030")
    };
    assert!(matches!(engine.search(&zero_page).await, Err(EngineError::InvalidPagination(_))));
}

#[tokio::test]
async fn engine_search_allows_past_dates() {
    let engine = new_engine("search_past.wal", Arc::new(SandboxGateway::new()));
    seed_paris(&engine).await;
    let past = criteria("Lyon", 2, "01-01-2001", "05-01-2001");
    let page = engine.search(&past).await.unwrap();
    assert_eq!(page.rooms.len(), 1);
    assert_eq!(page.rooms[0].resort, "Rhone");
}

#[tokio::test]
async fn engine_search_truncates_photos() {
    let engine = new_engine("search_photos.wal", Arc::new(SandboxGateway::new()));
    seed_resort(&engine, "Louvre", "France", "Paris").await;
    seed_room(&engine, "Louvre", 1, 2).await;
    seed_room(&engine, "Louvre", 2, 2).await;
    for position in 0..4 {
        engine
            .add_photo("Louvre", 1, Photo { position, url: format!("https://img/1/{position}") })
            .await
            .unwrap();
    }
    engine
        .add_photo("Louvre", 2, Photo { position: 0, url: "https://img/2/0".into() })
        .await
        .unwrap();

    let result = engine
        .search(&SearchCriteria { photos: Some(2), ..criteria("Paris", 2, &in_days(1), &in_days(2)) })
        .await
        .unwrap();
    assert_eq!(result.rooms[0].photos.len(), 2);
    assert_eq!(result.rooms[0].photos[1].url, "https://img/1/1");
    assert_eq!(result.rooms[1].photos.len(), 1);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn engine_wal_replay() {
    let path = test_wal_path("replay.wal");
    let gw = Arc::new(SandboxGateway::new());
    let committed = {
        let engine = Engine::new(path.clone(), gw.clone(), Duration::from_secs(5)).unwrap();
        seed_resort(&engine, "Amber", "Poland", "Gdansk").await;
        seed_room(&engine, "Amber", 1, 2).await;
        seed_room(&engine, "Amber", 2, 2).await;
        engine
            .add_photo("Amber", 1, Photo { position: 0, url: "https://img/0".into() })
            .await
            .unwrap();
        engine.delete_room("Amber", 2).await.unwrap();
        engine
            .commit_reservation(&request("Amber", 1, &in_days(3), &in_days(5)), &guest())
            .await
            .unwrap()
    };

    let engine2 = Engine::new(path, gw, Duration::from_secs(5)).unwrap();
    assert!(engine2.find_resort_by_name("Amber").is_some());
    assert!(engine2.get_room(&RoomKey::new("Amber", 2)).is_none());
    assert_eq!(engine2.get_reservations("Amber", 1).await.unwrap(), vec![committed]);
    let room = engine2.get_room(&RoomKey::new("Amber", 1)).unwrap();
    assert_eq!(room.state.read().await.room.photos.len(), 1);

    // the replayed reservation still blocks its range
    let again = engine2
        .commit_reservation(&request("Amber", 1, &in_days(4), &in_days(6)), &guest())
        .await;
    assert!(matches!(again, Err(EngineError::UnavailableTimePeriod)));
}

#[tokio::test]
async fn engine_compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let gw = Arc::new(SandboxGateway::new());
    {
        let engine = Engine::new(path.clone(), gw.clone(), Duration::from_secs(5)).unwrap();
        seed_resort(&engine, "Amber", "Poland", "Gdansk").await;
        seed_room(&engine, "Amber", 1, 2).await;
        seed_room(&engine, "Amber", 2, 3).await;
        for n in 0..10 {
            engine
                .add_photo("Amber", 1, Photo { position: n % 2, url: format!("https://img/{n}") })
                .await
                .unwrap();
        }
        engine.delete_room("Amber", 2).await.unwrap();
        engine
            .commit_reservation(&request("Amber", 1, &in_days(3), &in_days(5)), &guest())
            .await
            .unwrap();
        assert!(engine.wal_appends_since_compact().await > 0);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // appends after compaction land in the new log
        seed_room(&engine, "Amber", 3, 4).await;
    }

    let engine = Engine::new(path, gw, Duration::from_secs(5)).unwrap();
    let keys: Vec<String> = engine.list_rooms().into_iter().map(|(k, _)| k.to_string()).collect();
    assert_eq!(keys, vec!["Amber#1", "Amber#3"]);
    let room = engine.get_room(&RoomKey::new("Amber", 1)).unwrap();
    let guard = room.state.read().await;
    let urls: Vec<&str> = guard.room.photos.iter().map(|p| p.url.as_str()).collect();
    assert_eq!(urls, vec!["https://img/8", "https://img/9"]);
    assert_eq!(guard.room.reservations.len(), 1);
}
