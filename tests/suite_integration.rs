use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use harness::runner::Sink;
use harness::suite::{SuiteReport, TestStatus};
use harness::{H, HarnessError, Options, Suite, UnboundedGate};

fn options(verbose: bool) -> Options {
    Options {
        verbose,
        parallel: 4,
        ..Options::default()
    }
}

fn buffer() -> (Arc<Mutex<Vec<u8>>>, Sink) {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let sink: Sink = buf.clone();
    (buf, sink)
}

fn text(buf: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8(buf.lock().unwrap().clone()).unwrap()
}

fn run(suite: &Suite) -> (SuiteReport, String, String) {
    let (out, out_sink) = buffer();
    let (tap, tap_sink) = buffer();
    let report = suite
        .run_with(out_sink, Some(tap_sink))
        .expect("suite should run");
    (report, text(&out), text(&tap))
}

// ── end-to-end scenarios ───────────────────────────────

#[test]
fn passing_test_prints_only_pass() {
    let mut suite = Suite::new(options(false)).unwrap();
    suite.add("A", |_h: &H| {});
    let (report, out, tap) = run(&suite);
    assert_eq!(out, "PASS\n");
    assert_eq!(tap, "1..1\n");
    assert!(report.success());
    assert_eq!(report.tests[0].name, "A");
    assert_eq!(report.tests[0].status, TestStatus::Pass);
}

#[test]
fn failing_test_reports_fail() {
    let mut suite = Suite::new(options(false)).unwrap();
    suite.add("A", |_h: &H| {});
    suite.add("B", |h: &H| h.fatal("expected 200, got 500"));
    let (report, out, tap) = run(&suite);

    assert!(out.starts_with("--- FAIL: B ("));
    assert!(out.contains(": expected 200, got 500\n"));
    assert!(out.ends_with("FAIL\n"));
    assert_eq!(tap, "1..2\nnot ok - B\n");
    assert!(!report.success());
    assert_eq!(report.summary.passed, 1);
    assert_eq!(report.summary.failed, 1);
}

#[test]
fn verbose_output_nests_subtests() {
    let mut suite = Suite::new(options(true)).unwrap();
    suite.add("Top", |h: &H| {
        h.run("one", |h: &H| h.log("hello"));
        h.run("two", |h: &H| h.skip("later"));
    });
    let (report, out, tap) = run(&suite);

    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines[0], "=== RUN   Top");
    assert_eq!(lines[1], "=== RUN   Top/one");
    assert_eq!(lines[2], "=== RUN   Top/two");
    assert!(lines[3].starts_with("--- PASS: Top ("));
    assert!(lines[4].starts_with("    --- PASS: Top/one ("));
    assert!(lines[5].starts_with("            suite_integration.rs:"));
    assert!(lines[5].ends_with(": hello"));
    assert!(lines[6].starts_with("    --- SKIP: Top/two ("));
    assert!(lines[7].ends_with(": later"));
    assert_eq!(lines[8], "PASS");
    assert_eq!(tap, "1..1\nok - Top\n");
    assert!(report.success());
}

#[test]
fn skipped_top_level_test_is_reported_as_skip() {
    let mut suite = Suite::new(options(true)).unwrap();
    suite.add("S", |h: &H| h.skip_now());
    let (report, out, tap) = run(&suite);
    assert!(out.contains("--- SKIP: S ("));
    assert_eq!(tap, "1..1\nok - S # SKIP\n");
    assert_eq!(report.tests[0].status, TestStatus::Skip);
    assert!(report.success());
}

#[test]
fn failing_leaf_fails_every_ancestor() {
    let mut suite = Suite::new(options(false)).unwrap();
    suite.add("Outer", |h: &H| {
        h.run("mid", |h: &H| {
            h.run("leaf", |h: &H| h.error("nope"));
            assert!(h.failed());
        });
        assert!(h.failed());
    });
    let (report, out, _) = run(&suite);
    assert!(out.starts_with("--- FAIL: Outer ("));
    assert!(out.contains("\n    --- FAIL: Outer/mid ("));
    assert!(out.contains("\n        --- FAIL: Outer/mid/leaf ("));
    assert_eq!(report.tests[0].status, TestStatus::Fail);
}

// ── selection ──────────────────────────────────────────

#[test]
fn pattern_selects_tests_per_level() {
    let ran: Arc<Mutex<Vec<String>>> = Arc::default();
    let mut suite = Suite::new(Options {
        pattern: Some("Auth/login".into()),
        ..options(false)
    })
    .unwrap();

    let seen = Arc::clone(&ran);
    suite.add("Auth", move |h: &H| {
        for sub in ["login", "logout"] {
            let seen = Arc::clone(&seen);
            h.run(sub, move |h: &H| seen.lock().unwrap().push(h.name().to_owned()));
        }
    });
    let seen = Arc::clone(&ran);
    suite.add("Billing", move |h: &H| seen.lock().unwrap().push(h.name().to_owned()));

    let (report, out, _) = run(&suite);
    assert_eq!(*ran.lock().unwrap(), vec!["Auth/login"]);
    assert_eq!(report.tests.len(), 1);
    assert_eq!(report.tests[0].name, "Auth");
    assert_eq!(out, "PASS\n");
}

#[test]
fn nothing_selected_warns() {
    let mut suite = Suite::new(Options {
        pattern: Some("^Nope$".into()),
        ..options(false)
    })
    .unwrap();
    suite.add("A", |_h: &H| {});
    let (report, out, _) = run(&suite);
    assert_eq!(out, "harness: warning: no tests to run\nPASS\n");
    assert!(report.tests.is_empty());
}

#[test]
fn duplicate_names_are_made_unique() {
    let mut suite = Suite::new(options(true)).unwrap();
    suite.add("Dup", |_h: &H| {});
    suite.add("Dup", |_h: &H| {});
    let (report, _, tap) = run(&suite);
    let names: Vec<&str> = report.tests.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["Dup", "Dup#01"]);
    assert_eq!(tap, "1..2\nok - Dup\nok - Dup01\n");
}

#[test]
fn rerunning_a_suite_starts_fresh() {
    let mut suite = Suite::new(options(false)).unwrap();
    suite.add("Once", |_h: &H| {});
    let (first, _, _) = run(&suite);
    let (second, _, _) = run(&suite);
    assert_eq!(first.tests[0].name, "Once");
    assert_eq!(second.tests[0].name, "Once");
}

// ── parallelism ────────────────────────────────────────

#[test]
fn parallel_one_never_overlaps_tests() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut suite = Suite::new(Options {
        parallel: 1,
        ..options(false)
    })
    .unwrap();
    for name in ["P1", "P2", "P3"] {
        let (active, peak) = (Arc::clone(&active), Arc::clone(&peak));
        suite.add(name, move |h: &H| {
            h.parallel();
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(15));
            active.fetch_sub(1, Ordering::SeqCst);
        });
    }
    let (report, _, _) = run(&suite);
    assert!(report.success());
    assert_eq!(report.tests.len(), 3);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[test]
fn parallel_tests_overlap_with_unbounded_gate() {
    let barrier = Arc::new(std::sync::Barrier::new(3));
    let mut suite = Suite::with_gate(options(false), Arc::new(UnboundedGate)).unwrap();
    for name in ["P1", "P2", "P3"] {
        let barrier = Arc::clone(&barrier);
        suite.add(name, move |h: &H| {
            h.parallel();
            barrier.wait();
        });
    }
    let (report, _, _) = run(&suite);
    assert!(report.success());
}

#[test]
fn parallel_subtests_start_after_sequential_phase() {
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::default();
    let mut suite = Suite::new(options(false)).unwrap();
    let log = Arc::clone(&order);
    suite.add("Group", move |h: &H| {
        let c = Arc::clone(&log);
        h.run("C", move |h: &H| {
            h.parallel();
            c.lock().unwrap().push("C body");
        });
        let d = Arc::clone(&log);
        h.run("D", move |_h: &H| d.lock().unwrap().push("D body"));
        log.lock().unwrap().push("Group body done");
    });
    run(&suite);
    assert_eq!(
        *order.lock().unwrap(),
        vec!["D body", "Group body done", "C body"]
    );
}

// ── output directory ───────────────────────────────────

#[test]
fn output_dir_receives_tap_report_and_test_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("results");
    let mut suite = Suite::new(Options {
        output_dir: Some(root.clone()),
        ..options(false)
    })
    .unwrap();
    suite.add("Files", |h: &H| {
        let out = h.output_dir();
        assert!(out.ends_with("Files"));
        assert!(out.is_dir());

        let scratch = h.temp_dir("scratch");
        assert!(scratch.starts_with(&out));
        assert!(scratch.is_dir());

        let (mut file, path) = h.temp_file("data");
        writeln!(file, "payload").unwrap();
        assert!(path.starts_with(&out));
    });
    suite.add("Broken", |h: &H| h.fail());

    let (out, out_sink) = buffer();
    let report = suite.run_with(out_sink, None).unwrap();
    assert!(!report.success());
    assert!(text(&out).ends_with("FAIL\n"));

    let tap = std::fs::read_to_string(root.join("test.tap")).unwrap();
    assert_eq!(tap, "1..2\nnot ok - Broken\n");

    let json = std::fs::read_to_string(root.join("report.json")).unwrap();
    let parsed: SuiteReport = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.summary.total, 2);
    assert_eq!(parsed.summary.failed, 1);

    let files = std::fs::read_dir(root.join("Files")).unwrap().count();
    assert_eq!(files, 2);
}

#[test]
fn output_dir_failure_fails_the_test() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "not a directory").unwrap();

    let reached = Arc::new(AtomicUsize::new(0));
    let after = Arc::clone(&reached);
    let mut suite = Suite::new(Options {
        output_dir: Some(blocker),
        ..options(false)
    })
    .unwrap();
    suite.add("NoDir", move |h: &H| {
        h.output_dir();
        after.fetch_add(1, Ordering::SeqCst);
    });

    // An explicit TAP sink keeps the suite from creating its own files; the
    // JSON report cannot be written below a regular file either.
    let (out, out_sink) = buffer();
    let (_, tap_sink) = buffer();
    let result = suite.run_with(out_sink, Some(tap_sink));
    assert!(matches!(result, Err(HarnessError::Report(_))));

    let out = text(&out);
    assert!(out.starts_with("--- FAIL: NoDir ("));
    assert!(out.contains("Failed to create output dir"));
    assert!(out.ends_with("FAIL\n"));
    assert_eq!(reached.load(Ordering::SeqCst), 0);
}

// ── errors and faults ──────────────────────────────────

#[test]
fn zero_parallel_is_rejected() {
    let result = Suite::new(Options {
        parallel: 0,
        ..Options::default()
    });
    assert!(matches!(result, Err(HarnessError::InvalidOptions(_))));
}

#[test]
fn bad_pattern_is_rejected() {
    let result = Suite::new(Options {
        pattern: Some("(".into()),
        ..Options::default()
    });
    assert!(matches!(result, Err(HarnessError::Pattern { .. })));
}

#[test]
fn panicking_test_aborts_the_run() {
    let mut suite = Suite::new(options(false)).unwrap();
    suite.add("Boom", |h: &H| {
        h.run("inner", |_h: &H| panic!("kaboom"));
    });
    suite.add("Never", |_h: &H| unreachable!("run was aborted"));

    let (out, out_sink) = buffer();
    let result = panic::catch_unwind(AssertUnwindSafe(|| suite.run_with(out_sink, None)));
    let payload = result.expect_err("fault must propagate to the caller");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"kaboom"));

    let out = text(&out);
    assert!(out.contains("--- FAIL: Boom ("));
    assert!(out.contains("    --- FAIL: Boom/inner ("));
    assert!(!out.contains("PASS"));
}

#[test]
fn parallel_twice_aborts_the_run() {
    let mut suite = Suite::new(options(false)).unwrap();
    suite.add("Twice", |h: &H| {
        h.parallel();
        h.parallel();
    });
    let (_, out_sink) = buffer();
    let result = panic::catch_unwind(AssertUnwindSafe(|| suite.run_with(out_sink, None)));
    let payload = result.expect_err("protocol violation must abort");
    let message = payload.downcast_ref::<String>().unwrap();
    assert!(message.contains("parallel called multiple times"));
}

#[test]
fn fault_aborts_pending_parallel_tests() {
    let resumed = Arc::new(AtomicUsize::new(0));
    let mut suite = Suite::new(options(false)).unwrap();
    for name in ["P1", "P2", "P3"] {
        let resumed = Arc::clone(&resumed);
        suite.add(name, move |h: &H| {
            h.parallel();
            thread::sleep(Duration::from_millis(100));
            resumed.fetch_add(1, Ordering::SeqCst);
        });
    }
    suite.add("Boom", |_h: &H| panic!("kaboom"));

    let (_, out_sink) = buffer();
    let result = panic::catch_unwind(AssertUnwindSafe(|| suite.run_with(out_sink, None)));
    let payload = result.expect_err("fault must propagate to the caller");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"kaboom"));
    assert_eq!(resumed.load(Ordering::SeqCst), 0);
}

#[test]
fn violation_on_stray_thread_aborts_the_run() {
    let started = Arc::new(AtomicUsize::new(0));
    let leaked: Arc<Mutex<Option<H>>> = Arc::default();
    let mut suite = Suite::new(options(false)).unwrap();

    let slot = Arc::clone(&leaked);
    suite.add("Leak", move |h: &H| {
        *slot.lock().unwrap() = Some(h.clone());
    });
    let slot = Arc::clone(&leaked);
    suite.add("Trigger", move |_h: &H| {
        let stale = slot.lock().unwrap().take().unwrap();
        assert!(thread::spawn(move || stale.fail()).join().is_err());
    });
    for name in ["After1", "After2"] {
        let started = Arc::clone(&started);
        suite.add(name, move |_h: &H| {
            started.fetch_add(1, Ordering::SeqCst);
        });
    }

    let (_, out_sink) = buffer();
    let result = panic::catch_unwind(AssertUnwindSafe(|| suite.run_with(out_sink, None)));
    let payload = result.expect_err("protocol violation must abort");
    let message = payload.downcast_ref::<String>().unwrap();
    assert_eq!(message, "Fail in thread after Leak has completed");
    assert_eq!(started.load(Ordering::SeqCst), 0);
}

#[test]
fn background_thread_sees_cancellation() {
    let observed = Arc::new(AtomicUsize::new(0));
    let mut suite = Suite::new(options(false)).unwrap();
    let flag = Arc::clone(&observed);
    let handle: Arc<Mutex<Option<thread::JoinHandle<()>>>> = Arc::default();
    let slot = Arc::clone(&handle);
    suite.add("Bg", move |h: &H| {
        let ctx = h.context().clone();
        let flag = Arc::clone(&flag);
        *slot.lock().unwrap() = Some(thread::spawn(move || {
            ctx.wait();
            flag.fetch_add(1, Ordering::SeqCst);
        }));
    });
    run(&suite);
    let waiter = handle.lock().unwrap().take().unwrap();
    waiter.join().unwrap();
    assert_eq!(observed.load(Ordering::SeqCst), 1);
}
