// Copyright 2024 dprewarm developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use dwarm::{
    cache::MemoryCache,
    mock::{FailingSink, RecordingIpset, ScriptedResolver, StaticLister, StaticProbe, StaticWildcard},
    plan::{DomainGroup, RouteRule},
    resolver::Resolve,
    scheduler::{ConfigSource, ScheduleError, Scheduler},
    settings::RawSettings,
    store::RunStore,
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

struct TestConfig {
    groups: Mutex<Vec<DomainGroup>>,
    settings: Mutex<RawSettings>,
    profiles: Vec<String>,
}

impl TestConfig {
    fn new(groups: Vec<DomainGroup>, profiles: &[&str]) -> Self {
        Self {
            groups: Mutex::new(groups),
            settings: Mutex::new(RawSettings::default()),
            profiles: profiles.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn set_settings(&self, settings: RawSettings) {
        *self.settings.lock().unwrap() = settings;
    }
}

impl ConfigSource for TestConfig {
    fn domain_groups(&self) -> Vec<DomainGroup> {
        self.groups.lock().unwrap().clone()
    }

    fn profile_interfaces(&self) -> Vec<String> {
        self.profiles.clone()
    }

    fn settings(&self) -> RawSettings {
        self.settings.lock().unwrap().clone()
    }
}

fn simple_group() -> DomainGroup {
    DomainGroup {
        name: "g".into(),
        domains: vec![],
        rules: vec![RouteRule {
            domains: vec!["max.com".into()],
            wildcard_domains: vec![],
            ipset_v4: "g4".into(),
            ipset_v6: "g6".into(),
        }],
    }
}

struct Fixture {
    scheduler: Scheduler,
    config: Arc<TestConfig>,
    store: Arc<RunStore>,
    cache: Arc<MemoryCache>,
}

fn fixture_with(resolver: ScriptedResolver, groups: Vec<DomainGroup>) -> Fixture {
    let config = Arc::new(TestConfig::new(groups, &["wg-a"]));
    let store = Arc::new(RunStore::open_in_memory().unwrap());
    let cache = Arc::new(MemoryCache::new());
    let resolvers: Vec<Arc<dyn Resolve>> = vec![Arc::new(resolver)];
    let scheduler = Scheduler::builder(
        config.clone(),
        store.clone(),
        cache.clone(),
        Arc::new(RecordingIpset::new()),
    )
    .probe(Arc::new(StaticProbe::up(&["wg-a"])))
    .lister(Arc::new(StaticLister::new(&[])))
    .wildcard(Arc::new(StaticWildcard::new()))
    .resolvers(resolvers)
    .build();
    Fixture {
        scheduler,
        config,
        store,
        cache,
    }
}

async fn wait_idle(scheduler: &Scheduler) {
    for _ in 0..500 {
        if !scheduler.status().running {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("scheduler did not go idle");
}

#[tokio::test]
async fn trigger_runs_to_completion_and_persists_once() {
    let resolver = ScriptedResolver::new("mock").a("max.com", "wg-a", &["1.1.1.1"]);
    let fixture = fixture_with(resolver, vec![simple_group()]);

    fixture.scheduler.trigger_now().unwrap();
    wait_idle(&fixture.scheduler).await;

    let status = fixture.scheduler.status();
    let record = status.last_run.unwrap();
    assert_eq!(record.domains_total, 1);
    assert_eq!(record.domains_done, 1);
    assert_eq!(record.ips_inserted, 1);
    assert_eq!(record.error, "");
    assert!(record.id > 0);

    // Exactly one row in the store.
    assert_eq!(fixture.store.last_run().unwrap().unwrap().id, record.id);
    // The cache sink saw the snapshot.
    assert_eq!(fixture.cache.rows()["g4"].v4.len(), 1);
    assert!(status.progress.is_some());
}

#[tokio::test]
async fn second_trigger_while_running_is_rejected() {
    let resolver = ScriptedResolver::new("mock")
        .delay(Duration::from_millis(50))
        .a("max.com", "wg-a", &["1.1.1.1"]);
    let fixture = fixture_with(resolver, vec![simple_group()]);

    fixture.scheduler.trigger_now().unwrap();
    assert_eq!(
        fixture.scheduler.trigger_now(),
        Err(ScheduleError::RunInProgress)
    );
    wait_idle(&fixture.scheduler).await;
    // Back to idle: triggering works again.
    fixture.scheduler.trigger_now().unwrap();
    wait_idle(&fixture.scheduler).await;
}

#[tokio::test]
async fn cancel_when_idle_is_rejected() {
    let fixture = fixture_with(ScriptedResolver::new("mock"), vec![simple_group()]);
    assert_eq!(
        fixture.scheduler.cancel_run(),
        Err(ScheduleError::RunNotActive)
    );
}

#[tokio::test]
async fn broad_ecs_subnet_rejects_the_trigger_without_a_record() {
    let fixture = fixture_with(ScriptedResolver::new("mock"), vec![simple_group()]);
    fixture.config.set_settings(RawSettings {
        ecs_profiles: "eu=0.0.0.0/0".into(),
        ..RawSettings::default()
    });

    let err = fixture.scheduler.trigger_now().unwrap_err();
    assert!(matches!(err, ScheduleError::Settings(_)));
    assert!(!fixture.scheduler.status().running);
    assert!(fixture.store.last_run().unwrap().is_none());
}

#[tokio::test]
async fn canceled_run_still_persists_a_clean_record() {
    let domains: Vec<String> = (0..100).map(|i| format!("d{:03}.example.com", i)).collect();
    let mut resolver = ScriptedResolver::new("mock").delay(Duration::from_millis(20));
    for domain in &domains {
        resolver = resolver.a(domain, "wg-a", &["10.0.0.1"]);
    }
    let group = DomainGroup {
        name: "g".into(),
        domains: vec![],
        rules: vec![RouteRule {
            domains,
            wildcard_domains: vec![],
            ipset_v4: "g4".into(),
            ipset_v6: "g6".into(),
        }],
    };
    let fixture = fixture_with(resolver, vec![group]);

    fixture.scheduler.trigger_now().unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    fixture.scheduler.cancel_run().unwrap();
    wait_idle(&fixture.scheduler).await;

    let record = fixture.scheduler.status().last_run.unwrap();
    assert!(record.domains_done <= 100);
    // Cancellation is not an error.
    assert_eq!(record.error, "");
    assert_eq!(fixture.store.last_run().unwrap().unwrap().id, record.id);
}

#[tokio::test]
async fn sink_failure_joins_the_run_error() {
    let resolver = ScriptedResolver::new("mock").a("max.com", "wg-a", &["1.1.1.1"]);
    let config = Arc::new(TestConfig::new(vec![simple_group()], &["wg-a"]));
    let store = Arc::new(RunStore::open_in_memory().unwrap());
    let resolvers: Vec<Arc<dyn Resolve>> = vec![Arc::new(resolver)];
    let scheduler = Scheduler::builder(
        config,
        store.clone(),
        Arc::new(FailingSink),
        Arc::new(RecordingIpset::new()),
    )
    .probe(Arc::new(StaticProbe::up(&["wg-a"])))
    .lister(Arc::new(StaticLister::new(&[])))
    .wildcard(Arc::new(StaticWildcard::new()))
    .resolvers(resolvers)
    .build();

    scheduler.trigger_now().unwrap();
    wait_idle(&scheduler).await;

    let record = store.last_run().unwrap().unwrap();
    assert!(record.error.contains("sink"));
    // The run itself completed; counters are intact.
    assert_eq!(record.domains_done, 1);
}

#[tokio::test]
async fn clear_cache_and_run_clears_previous_rows() {
    let resolver = ScriptedResolver::new("mock").a("max.com", "wg-a", &["1.1.1.1"]);
    let fixture = fixture_with(resolver, vec![simple_group()]);

    // Seed a stale row.
    let mut stale = dwarm::cache::CacheSnapshot::new();
    stale.insert("stale-v4".into(), dwarm::cache::SetAddrs::default());
    use dwarm::cache::CacheSink;
    fixture.cache.replace(&stale).unwrap();

    fixture.scheduler.clear_cache_and_run().unwrap();
    wait_idle(&fixture.scheduler).await;

    let rows = fixture.cache.rows();
    assert!(!rows.contains_key("stale-v4"));
    assert!(rows.contains_key("g4"));
}

#[tokio::test]
async fn stop_cancels_the_active_run() {
    let domains: Vec<String> = (0..50).map(|i| format!("d{:02}.example.com", i)).collect();
    let mut resolver = ScriptedResolver::new("mock").delay(Duration::from_millis(20));
    for domain in &domains {
        resolver = resolver.a(domain, "wg-a", &["10.0.0.1"]);
    }
    let group = DomainGroup {
        name: "g".into(),
        domains: vec![],
        rules: vec![RouteRule {
            domains,
            wildcard_domains: vec![],
            ipset_v4: "g4".into(),
            ipset_v6: "g6".into(),
        }],
    };
    let fixture = fixture_with(resolver, vec![group]);

    fixture.scheduler.start();
    fixture.scheduler.trigger_now().unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    fixture.scheduler.stop().await;

    // stop() waited for the worker: a record exists and nothing runs.
    assert!(!fixture.scheduler.status().running);
    assert!(fixture.store.last_run().unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn timer_loop_triggers_at_the_configured_interval() {
    let resolver = ScriptedResolver::new("mock").a("max.com", "wg-a", &["1.1.1.1"]);
    let fixture = fixture_with(resolver, vec![simple_group()]);
    fixture.config.set_settings(RawSettings {
        interval_secs: 60,
        ..RawSettings::default()
    });

    fixture.scheduler.start();
    // Virtual time: the first tick fires after the configured interval.
    tokio::time::sleep(Duration::from_secs(61)).await;
    wait_idle(&fixture.scheduler).await;
    fixture.scheduler.stop().await;

    assert!(fixture.store.last_run().unwrap().is_some());
}

#[tokio::test]
async fn progress_handler_receives_the_final_snapshot() {
    let resolver = ScriptedResolver::new("mock").a("max.com", "wg-a", &["1.1.1.1"]);
    let fixture = fixture_with(resolver, vec![simple_group()]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    fixture
        .scheduler
        .set_progress_handler(Arc::new(move |progress| {
            seen2.lock().unwrap().push(progress);
        }));

    fixture.scheduler.trigger_now().unwrap();
    wait_idle(&fixture.scheduler).await;
    // Give the final emission a beat to land.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let seen = seen.lock().unwrap();
    assert!(seen.len() >= 2);
    let last = seen.last().unwrap();
    assert_eq!(last.processed_domains, 1);
    // Monotone processed counts across emissions.
    let mut prev = 0;
    for snapshot in seen.iter() {
        assert!(snapshot.processed_domains >= prev);
        prev = snapshot.processed_domains;
    }
}
