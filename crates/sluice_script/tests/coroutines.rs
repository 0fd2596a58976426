//! Script lines running as coroutines against a pump hub.

use chrono::{TimeZone, Utc};
use sluice_core::value::format_timestamp;
use sluice_core::{AppStatus, DynamicValue, Lifecycle, WorkQueue};
use sluice_events::{PumpHub, ScopedSubscription};
use sluice_script::{CoroutineHost, CoroutineState, ScriptOutcome};
use sluice_services::ScriptSettings;
use std::sync::{Arc, Mutex};
use std::thread;

const ECHO: &str = "const [pump, data] = await get_event_next(); return data;";

struct Fixture {
    host: CoroutineHost,
    lifecycle: Lifecycle,
    queue: Arc<WorkQueue>,
}

fn fixture() -> Fixture {
    let lifecycle = Lifecycle::new(AppStatus::Running);
    let host = CoroutineHost::new(
        PumpHub::new(),
        lifecycle.clone(),
        &ScriptSettings::default(),
    )
    .unwrap();
    Fixture {
        host,
        lifecycle,
        queue: WorkQueue::unnamed(),
    }
}

fn record(hub: &PumpHub, pump: &str) -> (ScopedSubscription, Arc<Mutex<Vec<DynamicValue>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let guard = hub.subscribe_scoped(pump, move |_, value| sink.lock().unwrap().push(value.clone()));
    (guard, seen)
}

/// Hand `value` to a script that returns whatever it receives.
fn round_trip(value: DynamicValue) -> ScriptOutcome {
    let f = fixture();
    let future = f.host.start_script_line(&f.queue, ECHO);
    let reply = future.reply_pump().to_string();
    f.queue.run_pending();
    f.host.hub().post(&reply, value);
    future.wait()
}

fn returned(value: DynamicValue) -> DynamicValue {
    let outcome = round_trip(value);
    assert_eq!(outcome.count, 1, "unexpected outcome {outcome:?}");
    outcome.value
}

#[test]
fn return_array_with_empty_object() {
    let f = fixture();
    let outcome = f.host.wait_script_line(&f.queue, "return [1, 2, 3, {}, 5]");
    assert_eq!(
        outcome.into_pair(),
        (
            1,
            DynamicValue::array([
                DynamicValue::from(1),
                DynamicValue::from(2),
                DynamicValue::from(3),
                DynamicValue::Undefined,
                DynamicValue::from(5),
            ])
        )
    );
}

#[test]
fn post_on_and_get_event_next() {
    let f = fixture();
    let (_guard, posts) = record(f.host.hub(), "testpump");

    let script = r#"
        post_on('testpump', 'entry');
        const pumps = get_event_pumps();
        post_on('testpump', 'get_event_pumps()');
        const replypump = pumps[0];
        post_on('testpump', replypump);
        post_on('testpump', 'get_event_next()');
        const [pump, data] = await get_event_next();
        post_on('testpump', data);
        post_on('testpump', 'exit');
    "#;
    let future = f.host.start_script_line(&f.queue, script);
    let reply = future.reply_pump().to_string();
    f.queue.run_pending();

    {
        let posts = posts.lock().unwrap();
        assert_eq!(posts.len(), 4);
        assert_eq!(posts[0], DynamicValue::from("entry"));
        assert_eq!(posts[1], DynamicValue::from("get_event_pumps()"));
        assert_eq!(posts[2], DynamicValue::from(reply.as_str()));
        assert_eq!(posts[3], DynamicValue::from("get_event_next()"));
    }

    // The post resumes the script before it returns.
    f.host.hub().post(&reply, "message");
    {
        let posts = posts.lock().unwrap();
        assert_eq!(posts.len(), 6);
        assert_eq!(posts[4], DynamicValue::from("message"));
        assert_eq!(posts[5], DynamicValue::from("exit"));
    }

    let outcome = future.wait();
    assert_eq!(outcome.count, 0);
    assert_eq!(outcome.state, CoroutineState::Completed);
}

#[test]
fn event_pumps_pair() {
    let f = fixture();
    let future = f.host.start_script_line(&f.queue, "return get_event_pumps()");
    let reply = future.reply_pump().to_string();
    f.queue.run_pending();
    assert_eq!(
        future.wait().value,
        DynamicValue::array([reply.as_str(), "ScriptCommand"])
    );
}

#[test]
fn scalars_round_trip() {
    assert_eq!(round_trip(DynamicValue::Undefined).into_pair(), (1, DynamicValue::Undefined));
    for value in [
        DynamicValue::from(true),
        DynamicValue::from(false),
        DynamicValue::from(17),
        DynamicValue::from(3.14),
        DynamicValue::from("string"),
        DynamicValue::from(vec![0u8, 1, 2, 255]),
    ] {
        assert_eq!(returned(value.clone()), value);
    }
    assert_eq!(returned(DynamicValue::from(27.0)), DynamicValue::from(27));
}

#[test]
fn tagged_scalars_come_back_as_strings() {
    let id = uuid::Uuid::parse_str("1d2b1b7c-e8a2-4a3b-9b1f-0d5d5f0c6e1a").unwrap();
    assert_eq!(
        returned(DynamicValue::from(id)),
        DynamicValue::from(id.to_string())
    );

    let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    assert_eq!(
        returned(DynamicValue::from(at)),
        DynamicValue::from(format_timestamp(&at))
    );

    assert_eq!(
        returned(DynamicValue::uri("https://example.com/path?q=1")),
        DynamicValue::from("https://example.com/path?q=1")
    );
}

#[test]
fn empty_containers_return_undefined() {
    assert!(returned(DynamicValue::empty_array()).is_undefined());
    assert!(returned(DynamicValue::empty_map()).is_undefined());
}

#[test]
fn arrays_keep_order_and_lose_trailing_undefined() {
    let sent = DynamicValue::array([
        DynamicValue::from("a"),
        DynamicValue::Undefined,
        DynamicValue::from(3),
        DynamicValue::Undefined,
        DynamicValue::Undefined,
    ]);
    assert_eq!(
        returned(sent),
        DynamicValue::array([
            DynamicValue::from("a"),
            DynamicValue::Undefined,
            DynamicValue::from(3)
        ])
    );
}

#[test]
fn maps_omit_undefined_values() {
    let sent = DynamicValue::map([
        ("name", DynamicValue::from("sluice")),
        ("missing", DynamicValue::Undefined),
        ("list", DynamicValue::array([1, 2])),
    ]);
    assert_eq!(
        returned(sent),
        DynamicValue::map([
            ("name", DynamicValue::from("sluice")),
            ("list", DynamicValue::array([1, 2])),
        ])
    );
}

#[test]
fn posted_arrays_drop_trailing_nulls() {
    let f = fixture();
    let (_guard, posts) = record(f.host.hub(), "p");
    let outcome = f.host.wait_script_line(
        &f.queue,
        "post_on('p', [1, null]); post_on('p', [null]); post_on('p', [null, 2]);",
    );
    assert_eq!(outcome.count, 0);
    assert_eq!(
        *posts.lock().unwrap(),
        vec![
            DynamicValue::array([1]),
            DynamicValue::Undefined,
            DynamicValue::array([DynamicValue::Undefined, DynamicValue::from(2)]),
        ]
    );
}

#[test]
fn posting_a_huge_sparse_array_is_safe() {
    let f = fixture();
    let (_guard, posts) = record(f.host.hub(), "p");
    let outcome = f.host.wait_script_line(
        &f.queue,
        "const a = []; a.length = 2 ** 32 - 1; post_on('p', a); return 'survived';",
    );
    assert_eq!(outcome.into_pair(), (1, DynamicValue::from("survived")));
    assert_eq!(*posts.lock().unwrap(), vec![DynamicValue::Undefined]);
}

#[test]
fn class_instances_are_not_posted() {
    let f = fixture();
    let outcome = f.host.wait_script_line(
        &f.queue,
        r#"
            const rejected = [];
            for (const value of [new Date(0), new Map([[1, 2]]), new Set(), /re/]) {
                try {
                    post_on('anywhere', value);
                } catch (e) {
                    if (e instanceof TypeError) rejected.push(true);
                }
            }
            return rejected.length;
        "#,
    );
    assert_eq!(outcome.into_pair(), (1, DynamicValue::from(4)));
}

#[test]
fn deeply_nested_map_round_trips() {
    let mut value = DynamicValue::from(20);
    for level in (0..20).rev() {
        value = DynamicValue::map([(format!("depth{level}"), value)]);
    }
    assert_eq!(returned(value.clone()), value);
}

#[test]
fn early_posts_are_not_lost() {
    let f = fixture();
    let future = f.host.start_script_line(
        &f.queue,
        r#"
            const [, first] = await get_event_next();
            const [, second] = await get_event_next();
            return [first, second];
        "#,
    );
    let reply = future.reply_pump().to_string();
    // Both arrive before the script has even started.
    f.host.hub().post(&reply, "one");
    f.host.hub().post(&reply, "two");
    f.queue.run_pending();
    assert_eq!(future.wait().value, DynamicValue::array(["one", "two"]));
}

#[test]
fn each_post_resumes_once() {
    let f = fixture();
    let (_guard, seen) = record(f.host.hub(), "seen");
    let future = f.host.start_script_line(
        &f.queue,
        r#"
            for (let i = 0; i < 3; i++) {
                const [, data] = await get_event_next();
                post_on('seen', data);
            }
            return 'done';
        "#,
    );
    let reply = future.reply_pump().to_string();
    f.queue.run_pending();

    for (posted, value) in ["a", "b", "c"].into_iter().enumerate() {
        f.host.hub().post(&reply, value);
        assert_eq!(seen.lock().unwrap().len(), posted + 1);
    }
    assert_eq!(future.wait().value, DynamicValue::from("done"));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            DynamicValue::from("a"),
            DynamicValue::from("b"),
            DynamicValue::from("c")
        ]
    );
}

#[test]
fn one_script_wakes_another() {
    let f = fixture();
    let waiting = f.host.start_script_line(&f.queue, ECHO);
    let reply = waiting.reply_pump().to_string();
    let poster = f
        .host
        .start_script_line(&f.queue, format!("post_on('{reply}', 'hello'); return 1;"));
    f.queue.run_pending();

    assert_eq!(poster.wait().into_pair(), (1, DynamicValue::from(1)));
    assert_eq!(waiting.wait().into_pair(), (1, DynamicValue::from("hello")));
}

#[test]
fn shutdown_cancels_on_resume() {
    let f = fixture();
    let (_guard, cleanup) = record(f.host.hub(), "cleanup");
    let future = f.host.start_script_line(
        &f.queue,
        r#"
            try {
                await get_event_next();
                return 'resumed';
            } finally {
                post_on('cleanup', 'unwound');
            }
        "#,
    );
    let reply = future.reply_pump().to_string();
    f.queue.run_pending();

    f.lifecycle.set_status(AppStatus::Stopping);
    f.host.hub().post(&reply, "too late");

    let outcome = future.wait();
    assert_eq!(outcome.state, CoroutineState::Cancelled);
    assert!(outcome.is_error());
    assert_eq!(*cleanup.lock().unwrap(), vec![DynamicValue::from("unwound")]);
    assert_eq!(f.host.active_coroutines(), 0);
}

#[test]
fn cancelled_when_suspending_after_shutdown() {
    let f = fixture();
    let (_guard, caught) = record(f.host.hub(), "caught");
    let future = f.host.start_script_line(
        &f.queue,
        r#"
            try {
                await get_event_next();
                return 'resumed';
            } catch (e) {
                post_on('caught', e instanceof TypeError);
                return 'swallowed';
            }
        "#,
    );
    f.lifecycle.set_status(AppStatus::Stopping);
    f.queue.run_pending();

    let outcome = future.wait();
    assert_eq!(outcome.state, CoroutineState::Cancelled);
    assert_eq!(outcome.count, -1);
    assert_eq!(*caught.lock().unwrap(), vec![DynamicValue::from(true)]);
    assert_eq!(f.host.active_coroutines(), 0);
}

#[test]
fn caught_cancellation_still_reports_cancelled() {
    let f = fixture();
    let future = f.host.start_script_line(
        &f.queue,
        r#"
            try {
                await get_event_next();
            } catch (e) {
                // Swallow it and try to return normally.
            }
            return 'carried on';
        "#,
    );
    let reply = future.reply_pump().to_string();
    f.queue.run_pending();

    f.lifecycle.set_status(AppStatus::Stopping);
    f.host.hub().post(&reply, "too late");

    let outcome = future.wait();
    assert_eq!(outcome.state, CoroutineState::Cancelled);
    assert!(outcome.is_error());
    assert_ne!(outcome.value, DynamicValue::from("carried on"));
}

#[test]
fn listen_attaches_script_to_another_pump() {
    let f = fixture();
    let (_guard, seen) = record(f.host.hub(), "seen");
    let future = f.host.start_script_line(
        &f.queue,
        r#"
            const [reply, command] = get_event_pumps();
            post_on(command, { op: 'listen', source: 'P', reply });
            const events = [];
            for (let i = 0; i < 2; i++) {
                const [pump, data] = await get_event_next();
                post_on('seen', data);
                events.push(pump, data);
            }
            post_on(command, { op: 'stoplistening', source: 'P', reply });
            return events;
        "#,
    );
    f.queue.run_pending();
    assert_eq!(f.host.hub().obtain("P").listener_count(), 1);

    f.host.hub().post("P", "first");
    assert_eq!(*seen.lock().unwrap(), vec![DynamicValue::from("first")]);
    f.host.hub().post("P", "second");
    assert_eq!(seen.lock().unwrap().len(), 2);

    assert_eq!(
        future.wait().into_pair(),
        (1, DynamicValue::array(["P", "first", "P", "second"]))
    );
    assert_eq!(f.host.hub().obtain("P").listener_count(), 0);
}

#[test]
fn finishing_detaches_listened_pumps() {
    let f = fixture();
    let future = f.host.start_script_line(
        &f.queue,
        r#"
            const [reply, command] = get_event_pumps();
            post_on(command, { op: 'listen', source: 'Q', reply });
            const [pump, data] = await get_event_next();
            return pump;
        "#,
    );
    f.queue.run_pending();
    f.host.hub().post("Q", 1);
    assert_eq!(future.wait().value, DynamicValue::from("Q"));
    assert_eq!(f.host.hub().obtain("Q").listener_count(), 0);
    // A late post finds nobody.
    assert_eq!(f.host.hub().post("Q", 2), 0);
}

#[test]
fn evaluation_errors_report_negative_count() {
    let f = fixture();
    let thrown = f.host.wait_script_line(&f.queue, "throw new Error('boom')");
    assert_eq!(thrown.count, -1);
    assert_eq!(thrown.state, CoroutineState::Errored);
    assert!(thrown.value.to_string_lossy().contains("boom"));

    let syntax = f.host.wait_script_line(&f.queue, "return )");
    assert_eq!(syntax.count, -1);
    assert_eq!(syntax.state, CoroutineState::Errored);
}

#[test]
fn unconvertible_post_throws_type_error() {
    let f = fixture();
    let outcome = f.host.wait_script_line(
        &f.queue,
        r#"
            try {
                post_on('anywhere', () => 1);
                return 'posted';
            } catch (e) {
                return e instanceof TypeError;
            }
        "#,
    );
    assert_eq!(outcome.into_pair(), (1, DynamicValue::from(true)));
}

#[test]
fn closed_queue_cancels_script() {
    let f = fixture();
    f.queue.close();
    let outcome = f.host.wait_script_line(&f.queue, "return 1");
    assert_eq!(outcome.state, CoroutineState::Cancelled);
    assert_eq!(f.host.active_coroutines(), 0);
}

#[test]
fn queue_serviced_on_another_thread() {
    let f = fixture();
    let runner = f.queue.clone();
    let worker = thread::spawn(move || runner.run_until_close());

    let future = f.host.start_script_line(&f.queue, ECHO);
    let reply = future.reply_pump().to_string();
    f.host.hub().post(&reply, 42);
    assert_eq!(future.wait().into_pair(), (1, DynamicValue::from(42)));

    f.queue.close();
    worker.join().unwrap();
}

#[test]
fn waiting_does_not_steal_from_the_queue_runner() {
    let f = fixture();
    let ran_on = Arc::new(Mutex::new(Vec::new()));
    let sink = ran_on.clone();
    let _guard = f.host.hub().subscribe_scoped("where", move |_, _| {
        sink.lock().unwrap().push(thread::current().id());
    });

    let runner = f.queue.clone();
    let worker = thread::spawn(move || runner.run_until_close());
    let worker_id = worker.thread().id();
    while !f.queue.has_other_runner() {
        thread::yield_now();
    }

    let host = f.host.clone();
    let queue = f.queue.clone();
    let tasks = ran_on.clone();
    let waiter = thread::spawn(move || {
        for _ in 0..3 {
            let sink = tasks.clone();
            queue.post(move || sink.lock().unwrap().push(thread::current().id()));
        }
        host.wait_script_line(&queue, "post_on('where', 1); await null; post_on('where', 2); return 7;")
    });

    assert_eq!(waiter.join().unwrap().into_pair(), (1, DynamicValue::from(7)));
    f.queue.close();
    worker.join().unwrap();

    let ran_on = ran_on.lock().unwrap();
    assert_eq!(ran_on.len(), 5);
    assert!(ran_on.iter().all(|id| *id == worker_id));
}
