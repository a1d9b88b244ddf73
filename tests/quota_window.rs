use chrono::{Duration, Local, TimeZone, Timelike};
use std::sync::Arc;
use video_searcher::{AdmissionController, AdmissionError, ManualClock, PrincipalRepository};

fn controller(quota: u32) -> (AdmissionController, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(
        Local.with_ymd_and_hms(2026, 7, 14, 22, 30, 0).unwrap(),
    ));
    let ctl = AdmissionController::new(Arc::new(PrincipalRepository::new()), clock.clone(), quota);
    (ctl, clock)
}

#[test]
fn one_request_per_day_by_default_contract() {
    let (ctl, _clock) = controller(1);
    let p = ctl.register("viewer@example.com");

    let first = ctl.check_quota(&p.id);
    assert!(first.allowed);
    assert_eq!(first.remaining, 1);

    ctl.record_usage(&p.id);
    let second = ctl.check_quota(&p.id);
    assert!(!second.allowed);
    assert_eq!(second.remaining, 0);
    assert_eq!(second.reset_at, first.reset_at);
}

#[test]
fn window_rolls_over_at_local_midnight() {
    let (ctl, clock) = controller(1);
    let p = ctl.register("viewer@example.com");
    ctl.try_admit(&p.id).unwrap().commit();
    assert!(!ctl.check_quota(&p.id).allowed);

    // 23:59:59 is still the same day
    clock.advance(Duration::minutes(89) + Duration::seconds(59));
    assert!(!ctl.check_quota(&p.id).allowed);

    clock.advance(Duration::seconds(1));
    let after = ctl.check_quota(&p.id);
    assert!(after.allowed);
    assert_eq!(after.remaining, 1);
    assert_eq!(after.reset_at.hour(), 0);
    assert_eq!(
        after.reset_at.date_naive(),
        Local.with_ymd_and_hms(2026, 7, 16, 0, 0, 0).unwrap().date_naive()
    );
    assert_eq!(ctl.quota_status(&p.id).unwrap().used, 0);
}

#[test]
fn idle_days_reset_to_the_next_midnight_after_now() {
    let (ctl, clock) = controller(2);
    let p = ctl.register("viewer@example.com");
    ctl.record_usage(&p.id);
    clock.advance(Duration::days(5));
    let status = ctl.quota_status(&p.id).unwrap();
    assert_eq!(status.used, 0);
    assert_eq!(status.remaining, 2);
    assert!(status.reset_at > clock_now(&clock));
    assert!(status.reset_at - clock_now(&clock) <= Duration::days(1));
}

fn clock_now(clock: &ManualClock) -> chrono::DateTime<Local> {
    use video_searcher::Clock;
    clock.now()
}

#[test]
fn concurrent_admission_never_overshoots() {
    let (ctl, _clock) = controller(3);
    let p = ctl.register("viewer@example.com");
    let results: Vec<bool> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ctl = ctl.clone();
                let id = p.id.clone();
                s.spawn(move || match ctl.try_admit(&id) {
                    Ok(ticket) => {
                        ticket.commit();
                        true
                    }
                    Err(AdmissionError::QuotaExceeded { remaining, .. }) => {
                        assert_eq!(remaining, 0);
                        false
                    }
                    Err(e) => panic!("unexpected {e}"),
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(results.iter().filter(|ok| **ok).count(), 3);
    assert_eq!(ctl.quota_status(&p.id).unwrap().used, 3);
}

#[test]
fn uncommitted_ticket_is_refunded() {
    let (ctl, _clock) = controller(1);
    let p = ctl.register("viewer@example.com");
    {
        let _ticket = ctl.try_admit(&p.id).unwrap();
        assert_eq!(ctl.quota_status(&p.id).unwrap().remaining, 0);
    }
    assert_eq!(ctl.quota_status(&p.id).unwrap().remaining, 1);
}

#[test]
fn unknown_principal_gets_nothing() {
    let (ctl, clock) = controller(1);
    let d = ctl.check_quota("missing");
    assert!(!d.allowed);
    assert_eq!(d.remaining, 0);
    assert_eq!(d.reset_at, clock_now(&clock));
    assert!(ctl.quota_status("missing").is_none());
    ctl.record_usage("missing");
    assert!(matches!(
        ctl.try_admit("missing"),
        Err(AdmissionError::UnknownPrincipal(_))
    ));
}
