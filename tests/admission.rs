//! End-to-end admission scenarios.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use turnstile::config::TurnstileConfig;
use turnstile::guard::{EndpointPolicy, Verdict};
use turnstile::ratelimit::{
    AdmissionController, AdmissionSettings, LimiterRegistry, ManualClock, Rate, RegistrySettings,
};

fn controller(wait_timeout: Duration) -> Arc<AdmissionController> {
    Arc::new(AdmissionController::new(
        Arc::new(LimiterRegistry::default()),
        AdmissionSettings {
            wait_timeout,
            ..Default::default()
        },
    ))
}

fn fire(controller: &Arc<AdmissionController>, requests: usize, rate: Rate) -> Vec<bool> {
    let barrier = Arc::new(Barrier::new(requests));
    let handles: Vec<_> = (0..requests)
        .map(|_| {
            let controller = Arc::clone(controller);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                controller.enter("127.0.0.1", "/api/v1", Some(rate))
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn burst_beyond_capacity_is_rejected() {
    let controller = controller(Duration::ZERO);

    let outcomes = fire(&controller, 20, Rate::PerSecond(5.0));

    assert!(outcomes.iter().any(|admitted| !admitted));
    assert!(outcomes.iter().any(|admitted| *admitted));
}

#[test]
fn unlimited_admits_everything() {
    let controller = controller(Duration::ZERO);

    assert!(fire(&controller, 50, Rate::Unlimited).into_iter().all(|a| a));
    assert!(fire(&controller, 50, Rate::PerSecond(0.0)).into_iter().all(|a| a));
}

#[test]
fn concurrent_first_access_creates_one_limiter() {
    let controller = controller(Duration::ZERO);

    fire(&controller, 32, Rate::PerSecond(1.0));

    assert_eq!(controller.registry().stats().limiters_created, 1);
}

#[test]
fn waiting_requests_are_smoothed_to_rate() {
    let controller = controller(Duration::from_millis(5000));
    let started = Instant::now();

    let outcomes = fire(&controller, 10, Rate::PerSecond(2.0));
    let elapsed = started.elapsed();

    assert!(outcomes.into_iter().all(|admitted| admitted));
    assert!(elapsed >= Duration::from_millis(4000), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(5000), "elapsed {:?}", elapsed);
}

#[test]
fn zero_patience_admits_only_first() {
    let controller = controller(Duration::ZERO);

    let outcomes: Vec<bool> = (0..3)
        .map(|_| controller.enter("127.0.0.1", "/api/v1", Some(Rate::PerSecond(1.0))))
        .collect();

    assert_eq!(outcomes, vec![true, false, false]);
}

#[test]
fn remove_caller_clears_pinned_rate() {
    let controller = controller(Duration::ZERO);

    assert!(controller.enter("1.2.3.4", "/x", Some(Rate::PerSecond(1.0))));
    // Pinned: a different requested rate is ignored while the entry lives.
    assert!(!controller.enter("1.2.3.4", "/x", Some(Rate::PerSecond(100.0))));

    assert!(controller.remove_caller("1.2.3.4"));
    assert!(controller.enter("1.2.3.4", "/x", Some(Rate::PerSecond(100.0))));

    let entry = controller.registry().get("1.2.3.4", "/x").unwrap();
    assert_eq!(entry.rate(), Rate::PerSecond(100.0));
    assert_eq!(controller.registry().stats().limiters_created, 2);
}

#[test]
fn idle_caller_is_recreated_after_ttl() {
    let clock = ManualClock::default();
    let registry = Arc::new(LimiterRegistry::with_clock(
        RegistrySettings {
            ttl: Duration::from_secs(300),
            ..Default::default()
        },
        Arc::new(clock.clone()),
    ));
    let controller = AdmissionController::new(
        Arc::clone(&registry),
        AdmissionSettings {
            wait_timeout: Duration::ZERO,
            ..Default::default()
        },
    );

    assert!(controller.enter("10.1.1.1", "/x", Some(Rate::PerSecond(1.0))));
    clock.advance(Duration::from_secs(301));
    assert!(controller.enter("10.1.1.1", "/x", Some(Rate::PerSecond(1.0))));

    assert_eq!(registry.stats().limiters_created, 2);
}

#[test]
fn capacity_keeps_most_recent_callers() {
    let registry = Arc::new(LimiterRegistry::new(RegistrySettings {
        max_callers: 50,
        ..Default::default()
    }));
    let controller = AdmissionController::new(Arc::clone(&registry), AdmissionSettings::default());

    for i in 0..200 {
        controller.enter(&format!("192.168.0.{}", i), "/x", Some(Rate::Unlimited));
    }

    assert!(registry.len() <= 50);
    assert!(registry.contains("192.168.0.199"));
    assert!(!registry.contains("192.168.0.0"));
}

#[test]
fn spray_of_new_callers_shares_capacity_scans() {
    let registry = Arc::new(LimiterRegistry::new(RegistrySettings {
        max_callers: 1000,
        ..Default::default()
    }));
    let controller = Arc::new(AdmissionController::new(
        Arc::clone(&registry),
        AdmissionSettings::default(),
    ));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let controller = Arc::clone(&controller);
            thread::spawn(move || {
                for i in 0..1000 {
                    let caller = format!("10.{}.{}.{}", t, i / 256, i % 256);
                    controller.enter(&caller, "/x", Some(Rate::Unlimited));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    controller.enter("10.9.0.0", "/x", Some(Rate::Unlimited));

    // About 7000 callers past capacity; every scan frees at least 50 slots.
    let stats = registry.stats();
    assert!(stats.capacity_scans > 0);
    assert!(stats.capacity_scans <= 200, "scans {}", stats.capacity_scans);
    assert!(registry.len() <= 1000);
    assert!(registry.contains("10.9.0.0"));
}

#[test]
fn unschedulable_rate_is_rejected_without_caching() {
    let controller = controller(Duration::from_millis(100));

    assert!(!controller.enter("10.0.0.1", "/x", Some(Rate::PerSecond(1e-20))));
    assert!(!controller.enter("10.0.0.1", "/x", Some(Rate::PerSecond(1e-19))));
    assert!(controller.registry().is_empty());

    assert!(controller.enter("10.0.0.1", "/x", Some(Rate::PerSecond(1.0))));
}

#[test]
fn guard_from_config_applies_endpoint_policy() {
    let config = TurnstileConfig::from_yaml(
        r#"
admission:
  wait_timeout_ms: 0
endpoints:
  /login:
    qps: 1
    alert_mode: alert_notify
"#,
    )
    .unwrap();
    let (_registry, guard) = turnstile::build(&config).unwrap();

    let login = config.endpoint_policy("/login").unwrap();
    assert_eq!(guard.check("c", "/login", &login).unwrap(), Verdict::Proceed);
    assert!(matches!(
        guard.check("c", "/login", &login).unwrap(),
        Verdict::Notify(_)
    ));

    let other: EndpointPolicy = config.endpoint_policy("/other").unwrap();
    assert_eq!(guard.check("c", "/other", &other).unwrap(), Verdict::Proceed);
}
