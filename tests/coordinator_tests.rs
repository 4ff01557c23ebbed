// Integration tests driving the coordination engine through its public
// API against a real project directory: dispatch, dependency gating,
// retries, file locking, crash recovery, and concurrent drivers.

use foreman::config::CoordinatorConfig;
use foreman::coordinator::{Coordinator, CoordinatorHandle};
use foreman::events::{
    CoordinatorEvent, EVENT_FILE_BLOCKED, EVENT_STORY_ASSIGNED, EVENT_STORY_MAX_RETRIES,
    EVENT_STORY_UNBLOCKED, EVENT_STORY_UPDATED,
};
use foreman::models::{Agent, AgentRole, Priority, Story, StoryStatus};
use rand::Rng;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn story(id: &str) -> Story {
    Story::new(id, format!("Story {}", id))
}

fn ids(stories: &[Story]) -> Vec<String> {
    stories.iter().map(|s| s.id.clone()).collect()
}

fn drain(rx: &mut UnboundedReceiver<CoordinatorEvent>) -> Vec<CoordinatorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn names(events: &[CoordinatorEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.name()).collect()
}

// Every live assignment must pair one agent with one story, with the
// story's own record agreeing
fn assert_consistent(c: &Coordinator) {
    let assignments = c.active_assignments();

    let mut agents: Vec<&String> = assignments.iter().map(|(a, _)| a).collect();
    agents.sort();
    let before = agents.len();
    agents.dedup();
    assert_eq!(before, agents.len(), "an agent holds two stories");

    let mut stories: Vec<&String> = assignments.iter().map(|(_, s)| s).collect();
    stories.sort();
    let before = stories.len();
    stories.dedup();
    assert_eq!(before, stories.len(), "a story is assigned twice");

    for (agent_id, story_id) in &assignments {
        let story = c.get_story(story_id).expect("assigned story must exist");
        assert_eq!(
            story.assigned_to.as_deref(),
            Some(agent_id.as_str()),
            "registry and story table disagree on '{}'",
            story_id
        );
    }
}

#[test]
fn test_two_coders_shared_file_flow() {
    init_logs();
    let temp = TempDir::new().unwrap();
    let mut c = Coordinator::init(CoordinatorConfig::new(temp.path())).unwrap();
    let mut rx = c.subscribe();

    c.register_agent(Agent::coder("c1")).unwrap();
    c.register_agent(Agent::coder("c2")).unwrap();

    c.submit_story(story("auth").with_priority(Priority::High))
        .unwrap();
    c.submit_story(story("profile").with_dependencies(vec!["auth".to_string()]))
        .unwrap();

    // Only auth is ready; profile waits on it
    assert_eq!(c.get_story("auth").unwrap().status, StoryStatus::InProgress);
    assert_eq!(c.get_story("auth").unwrap().assigned_to.as_deref(), Some("c1"));
    assert_eq!(c.get_story("profile").unwrap().status, StoryStatus::Backlog);
    assert_eq!(c.get_story("profile").unwrap().blocked_by, vec!["auth"]);

    // c1 locks the shared file; c2 is refused and told who holds it
    assert!(c
        .acquire_lock("src/models/user.rs", "c1", Some("auth".to_string()))
        .unwrap());
    assert!(!c
        .acquire_lock("src/models/user.rs", "c2", None)
        .unwrap());

    // Finishing auth releases its lock, unblocks profile, and hands
    // profile to the freed coder
    c.report_status_change("auth", StoryStatus::Done).unwrap();

    assert!(c.get_lock("src/models/user.rs").is_none());
    let profile = c.get_story("profile").unwrap();
    assert_eq!(profile.status, StoryStatus::InProgress);
    assert_eq!(profile.assigned_to.as_deref(), Some("c1"));

    let seen = names(&drain(&mut rx));
    assert!(seen.contains(&EVENT_FILE_BLOCKED));
    assert!(seen.contains(&EVENT_STORY_UNBLOCKED));
    assert!(seen.contains(&EVENT_STORY_ASSIGNED));

    let stats = c.stats();
    assert_eq!(stats.done, 1);
    assert_eq!(stats.in_progress, 1);
}

#[test]
fn test_dependency_chain_unblocks_in_order() {
    let temp = TempDir::new().unwrap();
    let mut c = Coordinator::init(CoordinatorConfig::new(temp.path())).unwrap();
    let mut rx = c.subscribe();

    c.submit_story(story("a")).unwrap();
    c.submit_story(story("b").with_dependencies(vec!["a".to_string()]))
        .unwrap();
    c.submit_story(story("c").with_dependencies(vec!["b".to_string()]))
        .unwrap();
    c.register_agent(Agent::coder("c1")).unwrap();
    drain(&mut rx);

    c.report_status_change("a", StoryStatus::Done).unwrap();
    let unblocked: Vec<String> = drain(&mut rx)
        .iter()
        .filter_map(|e| match e {
            CoordinatorEvent::StoryUnblocked(p) => Some(p.story_id.clone()),
            _ => None,
        })
        .collect();
    // a's completion clears b, but c still waits on b
    assert_eq!(unblocked, vec!["b"]);
    assert_eq!(c.get_story("c").unwrap().blocked_by, vec!["b"]);

    c.report_status_change("b", StoryStatus::Done).unwrap();
    let unblocked: Vec<String> = drain(&mut rx)
        .iter()
        .filter_map(|e| match e {
            CoordinatorEvent::StoryUnblocked(p) => Some(p.story_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(unblocked, vec!["c"]);

    c.report_status_change("c", StoryStatus::Done).unwrap();
    assert_eq!(c.stats().done, 3);
}

#[test]
fn test_tester_pipeline_event_order() {
    let temp = TempDir::new().unwrap();
    let mut c = Coordinator::init(CoordinatorConfig::new(temp.path())).unwrap();

    c.register_agent(Agent::coder("c1")).unwrap();
    c.register_agent(Agent::tester("t1")).unwrap();
    let mut rx = c.subscribe();

    c.submit_story(story("a")).unwrap();
    c.report_status_change("a", StoryStatus::Testing).unwrap();
    c.report_status_change("a", StoryStatus::Done).unwrap();

    let events = drain(&mut rx);
    assert_eq!(
        names(&events),
        vec![
            EVENT_STORY_ASSIGNED, // coder picks it up
            EVENT_STORY_UPDATED,  // in_progress -> testing
            EVENT_STORY_ASSIGNED, // tester picks it up
            EVENT_STORY_UPDATED,  // testing -> done
        ]
    );

    match (&events[0], &events[2]) {
        (CoordinatorEvent::StoryAssigned(first), CoordinatorEvent::StoryAssigned(second)) => {
            assert_eq!(first.agent_id, "c1");
            assert_eq!(first.role, AgentRole::Coder);
            assert_eq!(second.agent_id, "t1");
            assert_eq!(second.role, AgentRole::Tester);
        }
        other => panic!("unexpected events: {:?}", other),
    }
}

#[test]
fn test_retry_budget_exhaustion_is_terminal() {
    let temp = TempDir::new().unwrap();
    let mut c = Coordinator::init(CoordinatorConfig::new(temp.path())).unwrap();
    let mut rx = c.subscribe();

    c.register_agent(Agent::coder("c1")).unwrap();
    c.submit_story(story("flaky")).unwrap();
    c.submit_story(story("solid")).unwrap();

    // Default budget is three failures
    for _ in 0..3 {
        c.report_status_change("flaky", StoryStatus::Failed).unwrap();
    }

    let flaky = c.get_story("flaky").unwrap();
    assert_eq!(flaky.status, StoryStatus::Failed);
    assert_eq!(flaky.retry_count, 3);
    assert!(flaky.assigned_to.is_none());

    let events = drain(&mut rx);
    let terminal: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            CoordinatorEvent::StoryMaxRetries(p) => Some(p.retry_count),
            _ => None,
        })
        .collect();
    assert_eq!(terminal, vec![3]);

    // The pool moves on to the other story
    assert_eq!(c.get_story("solid").unwrap().status, StoryStatus::InProgress);
    assert!(c.get_ready_stories(AgentRole::Coder).is_empty());

    // Late duplicate failure reports change nothing
    c.report_status_change("flaky", StoryStatus::Failed).unwrap();
    assert_eq!(c.get_story("flaky").unwrap().retry_count, 3);
    assert!(!names(&drain(&mut rx)).contains(&EVENT_STORY_MAX_RETRIES));
}

#[test]
fn test_crash_recovery_round_trip() {
    init_logs();
    let temp = TempDir::new().unwrap();

    let ready_before: Vec<String>;
    {
        let mut c = Coordinator::init(CoordinatorConfig::new(temp.path())).unwrap();
        c.register_agent(Agent::coder("c1")).unwrap();

        c.submit_story(story("shipped")).unwrap();
        c.report_status_change("shipped", StoryStatus::Done).unwrap();

        c.submit_story(story("flight")).unwrap(); // taken by c1
        c.submit_story(story("urgent").with_priority(Priority::High))
            .unwrap();
        c.submit_story(story("routine")).unwrap();
        c.submit_story(story("gated").with_dependencies(vec!["flight".to_string()]))
            .unwrap();

        ready_before = ids(&c.get_ready_stories(AgentRole::Coder));
        assert_eq!(ready_before, vec!["urgent", "routine"]);
        // No shutdown: the process dies here
    }

    let mut c = Coordinator::load(CoordinatorConfig::new(temp.path())).unwrap();

    // Reload reproduces the same ready set
    assert_eq!(ids(&c.get_ready_stories(AgentRole::Coder)), ready_before);

    // In-flight work kept its status and assignee
    let flight = c.get_story("flight").unwrap();
    assert_eq!(flight.status, StoryStatus::InProgress);
    assert_eq!(flight.assigned_to.as_deref(), Some("c1"));
    assert_eq!(c.get_story("shipped").unwrap().status, StoryStatus::Done);
    assert_eq!(c.get_story("gated").unwrap().blocked_by, vec!["flight"]);

    // The dead process's agent is cleaned up like any other unregistration,
    // requeueing its story among the ready mediums
    c.unregister_agent("c1").unwrap();
    assert_eq!(
        ids(&c.get_ready_stories(AgentRole::Coder)),
        vec!["urgent", "flight", "routine"]
    );

    // A fresh pool picks up where the old one stopped
    c.register_agent(Agent::coder("c2")).unwrap();
    assert_eq!(c.get_story("urgent").unwrap().assigned_to.as_deref(), Some("c2"));
}

#[test]
fn test_restart_keeps_fresh_locks() {
    let temp = TempDir::new().unwrap();
    {
        let mut c = Coordinator::init(CoordinatorConfig::new(temp.path())).unwrap();
        c.register_agent(Agent::coder("c1")).unwrap();
        assert!(c.acquire_lock("src/db.rs", "c1", None).unwrap());
        c.shutdown().unwrap();
    }

    let mut c = Coordinator::load(CoordinatorConfig::new(temp.path())).unwrap();
    let lock = c.get_lock("src/db.rs").expect("fresh lock must survive");
    assert_eq!(lock.owner, "c1");

    // Still held against everyone else
    c.register_agent(Agent::coder("c2")).unwrap();
    assert!(!c.acquire_lock("src/db.rs", "c2", None).unwrap());

    // But the returning owner just refreshes it
    c.register_agent(Agent::coder("c1")).unwrap();
    assert!(c.acquire_lock("src/db.rs", "c1", None).unwrap());
}

#[test]
fn test_restart_discards_stale_locks() {
    let temp = TempDir::new().unwrap();
    {
        let mut c = Coordinator::init(
            CoordinatorConfig::new(temp.path()).with_lock_stale_secs(0),
        )
        .unwrap();
        c.register_agent(Agent::coder("c1")).unwrap();
        assert!(c.acquire_lock("src/db.rs", "c1", None).unwrap());
        c.shutdown().unwrap();
    }

    // Threshold zero: anything older than a second is reclaimable
    std::thread::sleep(std::time::Duration::from_millis(1100));

    let c = Coordinator::load(
        CoordinatorConfig::new(temp.path()).with_lock_stale_secs(0),
    )
    .unwrap();
    assert!(c.get_lock("src/db.rs").is_none());

    // The cleanup is persisted too
    let records = foreman::file_storage::load_locks(temp.path()).unwrap();
    assert!(records.is_empty());
}

#[test]
fn test_stale_lock_reclaimed_by_live_contender() {
    let temp = TempDir::new().unwrap();
    let mut c = Coordinator::init(
        CoordinatorConfig::new(temp.path()).with_lock_stale_secs(0),
    )
    .unwrap();

    c.register_agent(Agent::coder("c1")).unwrap();
    c.register_agent(Agent::coder("c2")).unwrap();

    assert!(c.acquire_lock("src/db.rs", "c1", None).unwrap());
    // Not a second old yet: still refused
    assert!(!c.acquire_lock("src/db.rs", "c2", None).unwrap());

    std::thread::sleep(std::time::Duration::from_millis(1100));

    // c1 went quiet past the threshold, so c2's acquire reclaims the path
    assert!(c.acquire_lock("src/db.rs", "c2", None).unwrap());
    assert_eq!(c.get_lock("src/db.rs").unwrap().owner, "c2");
}

#[test]
fn test_load_fails_loudly_on_corrupt_snapshot() {
    let temp = TempDir::new().unwrap();
    {
        let mut c = Coordinator::init(CoordinatorConfig::new(temp.path())).unwrap();
        c.submit_story(story("a")).unwrap();
    }

    let stories_path = foreman::file_storage::get_stories_path(temp.path());
    std::fs::write(&stories_path, "{ definitely not a snapshot").unwrap();

    let err = Coordinator::load(CoordinatorConfig::new(temp.path())).unwrap_err();
    assert!(matches!(
        err,
        foreman::coordinator::CoordinatorError::Persistence(_)
    ));
}

#[test]
fn test_load_on_empty_project_is_fresh_start() {
    let temp = TempDir::new().unwrap();
    let c = Coordinator::load(CoordinatorConfig::new(temp.path())).unwrap();
    assert_eq!(c.story_count(), 0);
    assert!(c.get_ready_stories(AgentRole::Coder).is_empty());
}

#[test]
fn test_ready_order_survives_restart() {
    let temp = TempDir::new().unwrap();
    {
        let mut c = Coordinator::init(CoordinatorConfig::new(temp.path())).unwrap();
        c.submit_story(story("low").with_priority(Priority::Low)).unwrap();
        c.submit_story(story("med-1")).unwrap();
        c.submit_story(story("high").with_priority(Priority::High)).unwrap();
        c.submit_story(story("med-2")).unwrap();

        assert_eq!(
            ids(&c.get_ready_stories(AgentRole::Coder)),
            vec!["high", "med-1", "med-2", "low"]
        );
    }

    let c = Coordinator::load(CoordinatorConfig::new(temp.path())).unwrap();
    assert_eq!(
        ids(&c.get_ready_stories(AgentRole::Coder)),
        vec!["high", "med-1", "med-2", "low"]
    );
}

#[test]
fn test_unregister_reroutes_to_remaining_pool() {
    let temp = TempDir::new().unwrap();
    let mut c = Coordinator::init(CoordinatorConfig::new(temp.path())).unwrap();

    c.register_agent(Agent::coder("c1")).unwrap();
    c.register_agent(Agent::coder("c2")).unwrap();
    c.submit_story(story("a")).unwrap();
    assert_eq!(c.get_story("a").unwrap().assigned_to.as_deref(), Some("c1"));

    c.unregister_agent("c1").unwrap();

    // Reverted and immediately picked up by the survivor
    let a = c.get_story("a").unwrap();
    assert_eq!(a.status, StoryStatus::InProgress);
    assert_eq!(a.assigned_to.as_deref(), Some("c2"));
}

#[test]
fn test_config_file_drives_retry_budget() {
    let temp = TempDir::new().unwrap();

    let manager = foreman::config::ConfigManager::new(temp.path());
    let mut file = manager.initialize().unwrap();
    file.dispatch.max_retries = 1;
    manager.write(&file).unwrap();

    let config = CoordinatorConfig::load(temp.path()).unwrap();
    assert_eq!(config.max_retries, 1);

    let mut c = Coordinator::init(config).unwrap();
    c.register_agent(Agent::coder("c1")).unwrap();
    c.submit_story(story("a")).unwrap();

    // One failure exhausts the configured budget
    c.report_status_change("a", StoryStatus::Failed).unwrap();
    let a = c.get_story("a").unwrap();
    assert_eq!(a.status, StoryStatus::Failed);
    assert_eq!(a.retry_count, 1);
    assert!(c.get_ready_stories(AgentRole::Coder).is_empty());
}

#[test]
fn test_no_double_assignment_under_concurrent_drivers() {
    init_logs();
    let temp = TempDir::new().unwrap();
    let mut c = Coordinator::init(
        CoordinatorConfig::new(temp.path()).with_max_retries(2),
    )
    .unwrap();

    let agent_ids: Vec<String> = (0..4).map(|i| format!("c{}", i)).collect();
    for id in &agent_ids {
        c.register_agent(Agent::coder(id.clone())).unwrap();
    }
    for i in 0..12 {
        let mut s = story(&format!("s{}", i));
        if i >= 3 {
            // Deterministic acyclic fan-in: s3 waits on s0, s4 on s1, ...
            s = s.with_dependencies(vec![format!("s{}", i - 3)]);
        }
        c.submit_story(s).unwrap();
    }

    let handle = CoordinatorHandle::new(c);
    let mut threads = Vec::new();
    for agent_id in agent_ids {
        let handle = handle.clone();
        threads.push(std::thread::spawn(move || {
            let mut rng = rand::thread_rng();
            for _ in 0..40 {
                handle.with(|c| {
                    assert_consistent(c);

                    let mine = c
                        .active_assignments()
                        .into_iter()
                        .find(|(a, _)| a == &agent_id)
                        .map(|(_, s)| s);
                    if let Some(story_id) = mine {
                        let outcome = if rng.gen_bool(0.25) {
                            StoryStatus::Failed
                        } else {
                            StoryStatus::Done
                        };
                        c.report_status_change(&story_id, outcome).unwrap();
                    }

                    assert_consistent(c);
                });
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }

    handle.with(|c| {
        assert_consistent(c);
        for s in c.stories() {
            if s.status == StoryStatus::Done {
                assert!(s.assigned_to.is_none());
            }
        }
        c.shutdown().unwrap();
    });

    // Everything the threads did survives a reload
    let c = Coordinator::load(CoordinatorConfig::new(temp.path())).unwrap();
    assert_eq!(c.story_count(), 12);
}

#[tokio::test]
async fn test_event_stream_over_async_subscriber() {
    let temp = TempDir::new().unwrap();
    let mut c = Coordinator::init(CoordinatorConfig::new(temp.path())).unwrap();
    let mut rx = c.subscribe();

    c.submit_story(story("a")).unwrap();
    c.register_agent(Agent::coder("c1")).unwrap();

    let first = rx.recv().await.expect("registration event");
    match first {
        CoordinatorEvent::AgentRegistered(p) => {
            assert_eq!(p.agent_id, "c1");
            assert_eq!(p.role, AgentRole::Coder);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let second = rx.recv().await.expect("assignment event");
    match second {
        CoordinatorEvent::StoryAssigned(p) => {
            assert_eq!(p.story_id, "a");
            assert_eq!(p.agent_id, "c1");
        }
        other => panic!("unexpected event: {:?}", other),
    }
}
