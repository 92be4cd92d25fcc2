//! Integration tests for the greenlet switching engine.
//!
//! Every `#[test]` runs on its own thread, so each test gets a fresh root
//! greenlet and stack pool.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::{Arc, Barrier};
use std::sync::mpsc;
use std::thread;

use parking_lot::Mutex;

use greenstack_runtime::{
    Args, Exception, Greenlet, GreenletError, GreenletId, HostContext, HostSnapshot, StackError,
    TraceEvent, Values, WeakGreenlet, args, current, gettrace, pool_stats, set_host_context,
    settrace,
};

fn parent() -> Greenlet {
    current().parent().expect("running greenlet has a parent")
}

fn greenlet_error(result: Result<Values, Exception>) -> Option<GreenletError> {
    result.err().and_then(|e| e.greenlet_error().cloned())
}

// ============================================================================
// BASIC SWITCHING
// ============================================================================

#[test]
fn test_switch_returns_result() {
    let root = current();
    let g1 = Greenlet::builder()
        .parent(&root)
        .run(|values| {
            let x: i32 = values.into_one().unwrap();
            Ok(Values::one(x * 2))
        })
        .build()
        .unwrap();

    let result = g1.switch(args![5_i32]).unwrap();
    assert_eq!(result.into_one::<i32>(), Some(10));
    assert!(g1.is_dead());
    assert!(!g1.is_active());
    assert!(g1.is_started());
}

#[test]
fn test_two_children_interleave() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let body = |log: Arc<Mutex<Vec<u32>>>| {
        move |_: Values| {
            log.lock().push(1);
            parent().switch(args![])?;
            log.lock().extend([1, 1]);
            Ok(Values::Empty)
        }
    };
    let g = Greenlet::new(body(log.clone()));
    let h = Greenlet::new(body(log.clone()));

    g.switch(args![]).unwrap();
    assert_eq!(log.lock().len(), 1);
    h.switch(args![]).unwrap();
    assert_eq!(log.lock().len(), 2);
    h.switch(args![]).unwrap();
    assert_eq!(log.lock().len(), 4);
    assert!(h.is_dead());
    g.switch(args![]).unwrap();
    assert_eq!(log.lock().len(), 6);
    assert!(g.is_dead());
}

#[test]
fn test_values_round_trip_through_suspension() {
    let g = Greenlet::new(|first: Values| {
        let text: String = first.into_one().unwrap();
        let second = parent().switch(args![text.len()])?;
        let flag: bool = second.into_one().unwrap();
        let third = parent().switch(args![!flag])?;
        assert!(third.is_empty());
        let fourth = parent().switch(args![])?;
        let (a, b): (i32, &str) = fourth.into_one().unwrap();
        Ok(Values::one(format!("{}{}", a, b)))
    });

    let r = g.switch(args![String::from("hello")]).unwrap();
    assert_eq!(r.into_one::<usize>(), Some(5));
    let r = g.switch(args![true]).unwrap();
    assert_eq!(r.into_one::<bool>(), Some(false));
    let r = g.switch(args![]).unwrap();
    assert!(r.is_empty());
    let r = g.switch(args![(7_i32, "x")]).unwrap();
    assert_eq!(r.into_one::<String>().as_deref(), Some("7x"));
    assert!(g.is_dead());
}

#[test]
fn test_finishing_without_value_yields_nothing() {
    let g = Greenlet::new(|_| Ok(Values::Empty));
    assert!(g.switch(args![1_i32]).unwrap().is_empty());
    assert!(g.is_dead());
}

#[test]
fn test_ping_pong_between_siblings() {
    let peers: Arc<Mutex<Vec<Greenlet>>> = Arc::default();
    let peer = |index: usize| {
        let peers = peers.clone();
        move || peers.lock()[index].clone()
    };

    let ping = {
        let pong = peer(1);
        Greenlet::new(move |values| {
            let mut n: u32 = values.into_one().unwrap();
            while n < 10 {
                n = pong().switch(args![n + 1])?.into_one().unwrap();
            }
            Ok(Values::one(n))
        })
    };
    let pong = {
        let ping = peer(0);
        Greenlet::new(move |values| {
            let mut n: u32 = values.into_one().unwrap();
            loop {
                n = ping().switch(args![n + 1])?.into_one().unwrap();
            }
        })
    };
    peers.lock().extend([ping.clone(), pong.clone()]);

    let result = ping.switch(args![0_u32]).unwrap();
    assert_eq!(result.into_one::<u32>(), Some(10));
    assert!(ping.is_dead());
    assert!(pong.is_active());
    peers.lock().clear();
}

#[test]
fn test_switch_to_self_returns_args() {
    let me = current();
    let r = me.switch(args![3_i32]).unwrap();
    assert_eq!(r.into_one::<i32>(), Some(3));

    let g = Greenlet::new(|_| {
        let again = current().switch(args!["same"])?;
        Ok(again)
    });
    assert_eq!(g.switch(args![]).unwrap().into_one::<&str>(), Some("same"));
}

#[test]
fn test_keyed_values_to_parent() {
    let g = Greenlet::new(|values| {
        let x: i32 = values.into_one().unwrap();
        parent().switch(Args::new().kwarg("x", x))?;
        parent().switch(args![2_i32].kwarg("x", 3_i32))?;
        Ok(Values::Many(vec![
            greenstack_runtime::Value::new(x),
            greenstack_runtime::Value::new(x * x),
        ]))
    });

    let r = g.switch(args![3_i32]).unwrap();
    assert!(matches!(r, Values::Keyed(_)));
    assert_eq!(r.get::<i32>("x"), Some(&3));

    let r = g.switch(args![]).unwrap();
    match &r {
        Values::Both(positional, keyed) => {
            assert_eq!(positional.len(), 1);
            assert_eq!(positional[0].downcast_ref::<i32>(), Some(&2));
            assert_eq!(keyed["x"].downcast_ref::<i32>(), Some(&3));
        }
        other => panic!("unexpected {:?}", other),
    }

    let r = g.switch(args![]).unwrap();
    let got: Vec<i32> = r
        .positional()
        .iter()
        .map(|v| *v.downcast_ref::<i32>().unwrap())
        .collect();
    assert_eq!(got, vec![3, 9]);
}

#[test]
fn test_deep_recursion_inside_greenlet() {
    fn depth(n: u64) -> u64 {
        let pad = [n; 32];
        if n == 0 { 0 } else { 1 + depth(n - 1) + pad[0] - n }
    }
    let g = Greenlet::new(|_| Ok(Values::one(depth(2000))));
    assert_eq!(g.switch(args![]).unwrap().into_one::<u64>(), Some(2000));
}

#[test]
fn test_custom_stack_size() {
    let g = Greenlet::builder()
        .stack_size(64 * 1024)
        .run(|_| {
            let size = current().stack_size().unwrap();
            Ok(Values::one(size))
        })
        .build()
        .unwrap();
    let size = g.switch(args![]).unwrap().into_one::<usize>().unwrap();
    assert!(size >= 64 * 1024);
    assert_eq!(g.stack_size(), Some(size));
}

// ============================================================================
// DEAD AND UNSTARTED TARGETS
// ============================================================================

#[test]
fn test_switch_to_dead_delegates_to_parent() {
    let g = Greenlet::new(|_| Ok(Values::Empty));
    g.switch(args![]).unwrap();
    assert!(g.is_dead());

    let r = g.switch(args![11_i32]).unwrap();
    assert_eq!(r.into_one::<i32>(), Some(11));
}

#[test]
fn test_unstarted_child_of_dead_parent() {
    let root = current();
    let order = Arc::new(Mutex::new(Vec::new()));

    let g1 = {
        let order = order.clone();
        Greenlet::builder()
            .parent(&root)
            .run(move |_| {
                order.lock().push("g1");
                Ok(Values::Empty)
            })
            .build()
            .unwrap()
    };
    let g2 = {
        let order = order.clone();
        Greenlet::builder()
            .parent(&g1)
            .run(move |_| {
                order.lock().push("g2");
                Ok(Values::one("from g2"))
            })
            .build()
            .unwrap()
    };

    g1.switch(args![]).unwrap();
    assert!(g1.is_dead());
    assert!(!g2.is_started());

    let r = g2.switch(args![]).unwrap();
    assert_eq!(r.into_one::<&str>(), Some("from g2"));
    assert!(g2.is_dead());
    assert_eq!(g2.parent(), Some(g1.clone()));
    assert_eq!(*order.lock(), vec!["g1", "g2"]);
}

#[test]
fn test_missing_run_is_an_error() {
    let g = Greenlet::empty();
    assert_eq!(greenlet_error(g.switch(args![])), Some(GreenletError::MissingRun));
    assert!(!g.is_started());

    g.set_run(|_| Ok(Values::one(1_u8))).unwrap();
    assert_eq!(g.switch(args![]).unwrap().into_one::<u8>(), Some(1));
}

#[test]
fn test_parent_without_run_passes_error_up() {
    let g1 = Greenlet::empty();
    let g2 = Greenlet::builder()
        .parent(&g1)
        .run(|_| Ok(Values::Empty))
        .build()
        .unwrap();

    assert_eq!(greenlet_error(g2.switch(args![])), Some(GreenletError::MissingRun));
    assert!(g2.is_dead());
    assert!(!g1.is_started());
}

#[test]
fn test_stack_exhaustion_leaves_greenlet_unstarted() {
    let g = Greenlet::builder()
        .stack_size(1 << 46)
        .run(|_| Ok(Values::one(1_u8)))
        .build()
        .unwrap();

    let err = g.switch(args![]).unwrap_err();
    assert!(
        matches!(
            err.greenlet_error(),
            Some(GreenletError::Stack(StackError::OutOfMemory { .. }))
        ),
        "unexpected error: {}",
        err
    );
    assert!(!g.is_started());
    assert!(g.has_run());
}

const ABORT_SCENARIO_VAR: &str = "GREENSTACK_TEST_ABORT_SCENARIO";

/// Finish a greenlet whose every ancestor belongs to another thread.
fn finish_with_only_foreign_ancestors() {
    let (root_tx, root_rx) = mpsc::channel::<Greenlet>();
    let (_hold_tx, hold_rx) = mpsc::channel::<()>();
    thread::spawn(move || {
        root_tx.send(current()).unwrap();
        let _ = hold_rx.recv();
    });
    let foreign_root = root_rx.recv().unwrap();

    let main = current();
    let detour = Greenlet::empty();
    let g = Greenlet::builder()
        .parent(&detour)
        .run(move |_| {
            main.switch(args![])?;
            Ok(Values::Empty)
        })
        .build()
        .unwrap();
    g.switch(args![]).unwrap();

    detour.set_parent(&foreign_root).unwrap();
    let _ = g.switch(args![]);
    unreachable!("a greenlet with no ancestor able to continue returned");
}

#[test]
fn test_finish_with_no_ancestor_able_to_continue_aborts() {
    use std::os::unix::process::ExitStatusExt;
    use std::process::Command;

    if std::env::var_os(ABORT_SCENARIO_VAR).is_some() {
        finish_with_only_foreign_ancestors();
        return;
    }

    let output = Command::new(std::env::current_exe().unwrap())
        .args([
            "test_finish_with_no_ancestor_able_to_continue_aborts",
            "--exact",
            "--nocapture",
            "--test-threads=1",
        ])
        .env(ABORT_SCENARIO_VAR, "1")
        .output()
        .unwrap();

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.signal(), Some(nix::libc::SIGABRT), "stderr: {}", stderr);
    assert!(stderr.contains("no ancestor able to continue"), "stderr: {}", stderr);
}

// ============================================================================
// EXCEPTIONS
// ============================================================================

#[test]
fn test_user_error_propagates_and_kills() {
    let g2 = Greenlet::new(|_| Err(Exception::user("boom")));
    let err = g2.switch(args![]).unwrap_err();
    assert_eq!(err.user_ref::<&str>(), Some(&"boom"));
    assert!(g2.is_dead());
}

#[test]
fn test_exit_is_a_normal_return() {
    let g = Greenlet::new(|_| Err(Exception::exit()));
    assert!(g.switch(args![]).unwrap().is_empty());
    assert!(g.is_dead());

    let g = Greenlet::new(|_| Err(Exception::exit_with(5_i32)));
    assert_eq!(g.switch(args![]).unwrap().into_one::<i32>(), Some(5));
}

#[test]
fn test_panic_is_carried_as_exception() {
    let g = Greenlet::new(|_| -> Result<Values, Exception> { panic!("inside greenlet") });
    let err = g.switch(args![]).unwrap_err();
    assert!(matches!(err, Exception::Panic(_)));
    assert!(err.to_string().contains("inside greenlet"));
    assert!(g.is_dead());

    let after = Greenlet::new(|_| Ok(Values::one(1_i32)));
    assert_eq!(after.switch(args![]).unwrap().into_one::<i32>(), Some(1));
}

#[test]
fn test_throw_into_suspended() {
    let g = Greenlet::new(|_| match parent().switch(args!["ready"]) {
        Err(exc) if exc.is_user::<u32>() => Ok(Values::one("caught")),
        Err(exc) => Err(exc),
        Ok(_) => Ok(Values::one("normal")),
    });
    assert_eq!(g.switch(args![]).unwrap().into_one::<&str>(), Some("ready"));
    let r = g.throw(Exception::user(7_u32)).unwrap();
    assert_eq!(r.into_one::<&str>(), Some("caught"));
    assert!(g.is_dead());
}

#[test]
fn test_throw_into_unstarted_skips_body() {
    let ran = Arc::new(Mutex::new(false));
    let g = {
        let ran = ran.clone();
        Greenlet::new(move |_| {
            *ran.lock() = true;
            Ok(Values::Empty)
        })
    };
    let err = g.throw(Exception::user("early")).unwrap_err();
    assert_eq!(err.user_ref::<&str>(), Some(&"early"));
    assert!(g.is_dead());
    assert!(!*ran.lock());

    let g = Greenlet::new(|_| Ok(Values::one("ran")));
    assert!(g.kill().unwrap().is_empty());
    assert!(g.is_dead());
}

#[test]
fn test_throw_to_dead() {
    let g = Greenlet::new(|_| Ok(Values::Empty));
    g.switch(args![]).unwrap();

    assert!(g.kill().unwrap().is_empty());
    assert_eq!(g.throw(Exception::exit_with(4_i32)).unwrap().into_one::<i32>(), Some(4));
    let err = g.throw(Exception::user("late")).unwrap_err();
    assert_eq!(err.user_ref::<&str>(), Some(&"late"));
}

#[test]
fn test_kill_suspended() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let g = {
        let seen = seen.clone();
        Greenlet::new(move |_| {
            let r = parent().switch(args![]);
            seen.lock().push(matches!(r, Err(ref e) if e.is_exit()));
            r
        })
    };
    g.switch(args![]).unwrap();
    assert!(g.kill().unwrap().is_empty());
    assert!(g.is_dead());
    assert_eq!(*seen.lock(), vec![true]);
}

#[test]
fn test_throw_goes_to_original_parent() {
    fn f1() -> impl FnOnce(Values) -> Result<Values, Exception> + Send {
        let main = current();
        move |_| match main.switch(args!["f1 ready to catch"]) {
            Err(exc) if exc.is_user::<&str>() => Ok(Values::one("caught")),
            Err(exc) => Err(exc),
            Ok(_) => Ok(Values::one("normal exit")),
        }
    }
    fn f2() -> impl FnOnce(Values) -> Result<Values, Exception> + Send {
        let main = current();
        move |_| {
            main.switch(args!["from f2"])?;
            Ok(Values::Empty)
        }
    }
    let pair = || {
        let g1 = Greenlet::new(f1());
        let g2 = Greenlet::builder().parent(&g1).run(f2()).build().unwrap();
        (g1, g2)
    };

    let (g1, g2) = pair();
    let err = g2.throw(Exception::user("index")).unwrap_err();
    assert!(err.is_user::<&str>());
    assert!(g2.is_dead());
    assert!(g1.is_dead());

    let (g1, g2) = pair();
    assert_eq!(g1.switch(args![]).unwrap().into_one::<&str>(), Some("f1 ready to catch"));
    let r = g2.throw(Exception::user("index")).unwrap();
    assert_eq!(r.into_one::<&str>(), Some("caught"));
    assert!(g2.is_dead());
    assert!(g1.is_dead());

    let (g1, g2) = pair();
    assert_eq!(g1.switch(args![]).unwrap().into_one::<&str>(), Some("f1 ready to catch"));
    assert_eq!(g2.switch(args![]).unwrap().into_one::<&str>(), Some("from f2"));
    let r = g2.throw(Exception::user("index")).unwrap();
    assert_eq!(r.into_one::<&str>(), Some("caught"));
    assert!(g2.is_dead());
    assert!(g1.is_dead());
}

// ============================================================================
// PARENTS
// ============================================================================

#[test]
fn test_cycle_is_rejected_and_state_unchanged() {
    let a = Greenlet::empty();
    let b = Greenlet::builder().parent(&a).build().unwrap();
    let c = Greenlet::builder().parent(&b).build().unwrap();

    assert_eq!(a.set_parent(&c), Err(GreenletError::CyclicParent));
    assert_eq!(a.parent(), Some(current()));
    assert_eq!(b.parent(), Some(a.clone()));
    assert_eq!(c.parent(), Some(b.clone()));
}

#[test]
fn test_reparent_changes_return_target() {
    let g = Greenlet::new(|_| Ok(Values::one("done")));
    let middle = Greenlet::new(move |_| {
        g.set_parent(&current()).unwrap();
        let r = g.switch(args![])?;
        Ok(Values::one(format!("middle saw {}", r.into_one::<&str>().unwrap())))
    });
    let r = middle.switch(args![]).unwrap();
    assert_eq!(r.into_one::<String>().as_deref(), Some("middle saw done"));
}

#[test]
fn test_parent_restored_on_kill() {
    let hub = Greenlet::new(|_| Ok(Values::Empty));
    let main = current();
    let result: Arc<Mutex<Vec<Greenlet>>> = Arc::new(Mutex::new(Vec::new()));

    let g = {
        let hub = hub.clone();
        let result = result.clone();
        Greenlet::builder()
            .parent(&hub)
            .run(move |_| match main.switch(args![]) {
                Err(exc) if exc.is_exit() => {
                    let me = current();
                    result.lock().push(me.parent().unwrap());
                    result.lock().push(me);
                    hub.switch(args![])?;
                    Ok(Values::Empty)
                }
                other => other,
            })
            .build()
            .unwrap()
    };
    g.switch(args![]).unwrap();
    drop(g);

    let result = result.lock();
    assert_eq!(result.len(), 2);
    assert_eq!(result[0], current());
    assert_eq!(result[1].parent(), Some(hub.clone()));
    assert!(result[1].is_active());
}

// ============================================================================
// TEARDOWN
// ============================================================================

#[test]
fn test_drop_kills_suspended() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let g = {
        let seen = seen.clone();
        Greenlet::new(move |_| match parent().switch(args![]) {
            Err(exc) if exc.is_exit() => {
                seen.lock().push("exit");
                Err(exc)
            }
            other => other,
        })
    };
    g.switch(args![]).unwrap();
    let weak = g.downgrade();
    drop(g);

    assert_eq!(*seen.lock(), vec!["exit"]);
    assert!(weak.upgrade().is_none());
}

#[test]
fn test_switch_args_not_lost_before_drop() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let g = {
        let seen = seen.clone();
        Greenlet::new(move |_| {
            let value = parent().switch(args![])?;
            seen.lock().push(value.into_one::<i32>().unwrap());
            parent().switch(args![])?;
            seen.lock().push(-1);
            Ok(Values::Empty)
        })
    };
    g.switch(args![]).unwrap();
    g.switch(args![42_i32]).unwrap();
    drop(g);
    assert_eq!(*seen.lock(), vec![42]);
}

#[test]
fn test_unstarted_and_dead_drop_quietly() {
    let ran = Arc::new(Mutex::new(0));
    let unstarted = {
        let ran = ran.clone();
        Greenlet::new(move |_| {
            *ran.lock() += 1;
            Ok(Values::Empty)
        })
    };
    drop(unstarted);

    let dead = Greenlet::new(|_| Ok(Values::Empty));
    dead.switch(args![]).unwrap();
    drop(dead);

    assert_eq!(*ran.lock(), 0);
}

#[test]
fn test_resurrected_greenlet_survives() {
    let keep: Arc<Mutex<Option<Greenlet>>> = Arc::new(Mutex::new(None));
    let g = {
        let keep = keep.clone();
        Greenlet::new(move |_| {
            match parent().switch(args![]) {
                Err(exc) if exc.is_exit() => {
                    *keep.lock() = Some(current());
                    parent().switch(args![])?;
                }
                other => {
                    other?;
                }
            }
            Ok(Values::one("finally"))
        })
    };
    g.switch(args![]).unwrap();
    let id = g.id();
    drop(g);

    let survivor = keep.lock().take().unwrap();
    assert_eq!(survivor.id(), id);
    assert!(survivor.is_active());
    assert_eq!(survivor.parent(), Some(current()));
    assert_eq!(survivor.switch(args![]).unwrap().into_one::<&str>(), Some("finally"));
    assert!(survivor.is_dead());
}

#[test]
fn test_swallowed_exit_leaks_instead_of_freeing() {
    let last_seen: Arc<Mutex<WeakGreenlet>> = Arc::new(Mutex::new(WeakGreenlet::default()));
    let g = {
        let last_seen = last_seen.clone();
        Greenlet::new(move |_| {
            loop {
                *last_seen.lock() = current().downgrade();
                let _ = parent().switch(args![]);
            }
        })
    };
    g.switch(args![]).unwrap();
    let id = g.id();
    drop(g);

    let leaked = last_seen.lock().upgrade().expect("leaked greenlet stays allocated");
    assert_eq!(leaked.id(), id);
    assert!(leaked.is_active());
}

#[test]
fn test_concurrent_last_drops_unwind_on_owner() {
    for _ in 0..200 {
        let unwound_on = Arc::new(Mutex::new(Vec::new()));
        let g = {
            let unwound_on = unwound_on.clone();
            Greenlet::new(move |_| match parent().switch(args![]) {
                Err(exc) if exc.is_exit() => {
                    unwound_on.lock().push(thread::current().id());
                    Err(exc)
                }
                other => other,
            })
        };
        g.switch(args![]).unwrap();

        let dropped = Arc::new(Barrier::new(2));
        let released = Arc::new(Barrier::new(2));
        let helper = {
            let g = g.clone();
            let (dropped, released) = (dropped.clone(), released.clone());
            thread::spawn(move || {
                dropped.wait();
                drop(g);
                released.wait();
            })
        };
        dropped.wait();
        drop(g);
        released.wait();
        helper.join().unwrap();

        // Whichever thread let go last, the frames unwind here.
        let _ = current();
        assert_eq!(*unwound_on.lock(), vec![thread::current().id()]);
    }
}

#[test]
fn test_posted_teardown_returns_stack_to_owner_pool() {
    let (handle_tx, handle_rx) = mpsc::channel::<Greenlet>();
    let (dropped_tx, dropped_rx) = mpsc::channel::<()>();

    let owner = thread::spawn(move || {
        let g = Greenlet::new(|_| {
            parent().switch(args![])?;
            Ok(Values::Empty)
        });
        g.switch(args![]).unwrap();
        handle_tx.send(g).unwrap();
        dropped_rx.recv().unwrap();

        let before = pool_stats().cached;
        let _ = current();
        (before, pool_stats().cached)
    });

    drop(handle_rx.recv().unwrap());
    dropped_tx.send(()).unwrap();

    let (before, after) = owner.join().unwrap();
    assert_eq!(after, before + 1);
}

#[test]
fn test_dropping_long_parent_chain() {
    thread::Builder::new()
        .stack_size(256 * 1024)
        .spawn(|| {
            let mut tail = current();
            for _ in 0..5_000 {
                tail = Greenlet::builder().parent(&tail).build().unwrap();
            }
            let weak = tail.downgrade();
            drop(tail);
            assert!(weak.upgrade().is_none());
        })
        .unwrap()
        .join()
        .unwrap();
}

#[test]
fn test_dropping_chain_kills_suspended_link() {
    let seen = Arc::new(Mutex::new(Vec::<&'static str>::new()));
    let suspended = {
        let seen = seen.clone();
        Greenlet::new(move |_| match parent().switch(args![]) {
            Err(exc) if exc.is_exit() => {
                seen.lock().push("exit");
                Err(exc)
            }
            other => other,
        })
    };
    suspended.switch(args![]).unwrap();

    let mut tail = Greenlet::builder().parent(&suspended).build().unwrap();
    drop(suspended);
    for _ in 0..100 {
        tail = Greenlet::builder().parent(&tail).build().unwrap();
    }
    assert!(seen.lock().is_empty());
    drop(tail);
    assert_eq!(*seen.lock(), vec!["exit"]);
}

#[test]
fn test_deferred_teardown_on_owner_thread() {
    let seen = Arc::new(Mutex::new(Vec::<&'static str>::new()));
    let (handle_tx, handle_rx) = mpsc::channel::<Greenlet>();
    let (dropped_tx, dropped_rx) = mpsc::channel::<()>();

    let owner = {
        let seen = seen.clone();
        thread::spawn(move || {
            let g = {
                let seen = seen.clone();
                Greenlet::new(move |_| match parent().switch(args![]) {
                    Err(exc) if exc.is_exit() => {
                        seen.lock().push("exit");
                        Ok(Values::Empty)
                    }
                    other => other,
                })
            };
            g.switch(args![]).unwrap();
            handle_tx.send(g).unwrap();
            dropped_rx.recv().unwrap();

            let before = seen.lock().clone();
            let _ = current();
            (before, seen.lock().clone())
        })
    };

    let g = handle_rx.recv().unwrap();
    assert!(g.is_active());
    assert_ne!(g.thread_id(), Some(thread::current().id()));
    drop(g);
    dropped_tx.send(()).unwrap();

    let (before, after) = owner.join().unwrap();
    assert!(before.is_empty());
    assert_eq!(after, vec!["exit"]);
}

#[test]
fn test_drop_after_owner_exit_does_not_run_frames() {
    let seen = Arc::new(Mutex::new(Vec::<&'static str>::new()));
    let g = {
        let seen = seen.clone();
        thread::spawn(move || {
            let g = Greenlet::new(move |_| {
                let r = parent().switch(args![]);
                seen.lock().push(if r.is_ok() { "resumed" } else { "raised" });
                r
            });
            g.switch(args![]).unwrap();
            g
        })
        .join()
        .unwrap()
    };

    assert_eq!(greenlet_error(g.switch(args![])), Some(GreenletError::GarbageCollected));
    drop(g);
    assert!(seen.lock().is_empty());
}

// ============================================================================
// THREAD AFFINITY
// ============================================================================

#[test]
fn test_switch_from_other_thread_fails() {
    let g = Greenlet::new(|_| Ok(Values::Empty));
    let err = thread::scope(|s| {
        s.spawn(|| greenlet_error(g.switch(args![])))
            .join()
            .unwrap()
    });

    assert_eq!(err, Some(GreenletError::WrongThread));
    assert!(!g.is_started());
    assert!(g.switch(args![]).unwrap().is_empty());
}

#[test]
fn test_throw_from_other_thread_fails() {
    let g = Greenlet::new(|_| {
        parent().switch(args![])?;
        Ok(Values::Empty)
    });
    g.switch(args![]).unwrap();

    let err = thread::scope(|s| {
        s.spawn(|| greenlet_error(g.throw(Exception::user(1_i32))))
            .join()
            .unwrap()
    });
    assert_eq!(err, Some(GreenletError::WrongThread));
    assert!(g.is_active());
    g.switch(args![]).unwrap();
    assert!(g.is_dead());
}

#[test]
fn test_greenlet_of_exited_thread_is_collected() {
    let orphan = thread::spawn(|| Greenlet::new(|_| Ok(Values::Empty)))
        .join()
        .unwrap();
    assert_eq!(greenlet_error(orphan.switch(args![])), Some(GreenletError::GarbageCollected));

    let local = Greenlet::empty();
    assert_eq!(local.set_parent(&orphan), Err(GreenletError::ParentGarbageCollected));
    assert_eq!(local.parent(), Some(current()));
}

#[test]
fn test_reparent_across_threads() {
    let (tx, rx) = mpsc::channel::<Greenlet>();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let foreign_thread = thread::spawn(move || {
        tx.send(Greenlet::new(|_| Ok(Values::Empty))).unwrap();
        done_rx.recv().unwrap();
    });
    let foreign = rx.recv().unwrap();

    let started = Greenlet::new(|_| {
        parent().switch(args![])?;
        Ok(Values::Empty)
    });
    started.switch(args![]).unwrap();
    assert_eq!(
        started.set_parent(&foreign),
        Err(GreenletError::ParentOnDifferentThread)
    );

    let unstarted = Greenlet::new(|_| Ok(Values::Empty));
    unstarted.set_parent(&foreign).unwrap();
    assert_eq!(greenlet_error(unstarted.switch(args![])), Some(GreenletError::WrongThread));

    done_tx.send(()).unwrap();
    foreign_thread.join().unwrap();
}

#[test]
fn test_threads_run_independently() {
    let handles: Vec<_> = (0..4_u64)
        .map(|t| {
            thread::spawn(move || {
                let g = Greenlet::new(move |values| {
                    let mut total: u64 = values.into_one().unwrap();
                    for _ in 0..100 {
                        total += parent().switch(args![total])?.into_one::<u64>().unwrap();
                    }
                    Ok(Values::one(total))
                });
                let mut last = g.switch(args![t]).unwrap();
                while !g.is_dead() {
                    last = g.switch(args![1_u64]).unwrap();
                }
                (current().thread_id(), last.into_one::<u64>().unwrap())
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for (t, (_, total)) in results.iter().enumerate() {
        assert_eq!(*total, t as u64 + 100);
    }
    assert_ne!(results[0].0, results[1].0);
}

// ============================================================================
// TRACING AND HOST STATE
// ============================================================================

#[test]
fn test_trace_events() {
    let events: Rc<RefCell<Vec<(TraceEvent, GreenletId, GreenletId)>>> = Rc::default();
    {
        let events = events.clone();
        settrace(Some(Rc::new(move |event: TraceEvent, origin: &Greenlet, target: &Greenlet| {
            events.borrow_mut().push((event, origin.id(), target.id()));
            Ok(())
        })));
    }

    let main = current();
    let g1 = Greenlet::new(|_| Ok(Values::Empty));
    g1.switch(args![]).unwrap();
    let g2 = Greenlet::new(|_| Err(Exception::user("fail")));
    assert!(g2.switch(args![]).is_err());
    assert!(settrace(None).is_some());

    assert_eq!(
        *events.borrow(),
        vec![
            (TraceEvent::Switch, main.id(), g1.id()),
            (TraceEvent::Switch, g1.id(), main.id()),
            (TraceEvent::Switch, main.id(), g2.id()),
            (TraceEvent::Throw, g2.id(), main.id()),
        ]
    );
}

#[test]
fn test_failing_trace_is_disabled_and_thrown_at_target() {
    let main = current();
    let g = Greenlet::new(move |_| {
        main.switch(args![])?;
        Ok(Values::one("not reached"))
    });
    g.switch(args![]).unwrap();

    let calls = Rc::new(Cell::new(0));
    {
        let calls = calls.clone();
        settrace(Some(Rc::new(move |_: TraceEvent, _: &Greenlet, _: &Greenlet| {
            calls.set(calls.get() + 1);
            Err(Exception::user("tracer failed"))
        })));
    }

    let err = g.switch(args![]).unwrap_err();
    assert_eq!(err.user_ref::<&str>(), Some(&"tracer failed"));
    assert!(gettrace().is_none());
    assert_eq!(calls.get(), 1);
    assert!(g.is_dead());
}

thread_local! {
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

struct DepthHost;

impl HostContext for DepthHost {
    fn snapshot(&self) -> HostSnapshot {
        HostSnapshot::new(DEPTH.get())
    }

    fn restore(&self, snapshot: HostSnapshot) {
        DEPTH.set(snapshot.downcast::<u32>().unwrap_or(0));
    }

    fn reset(&self) {
        DEPTH.set(0);
    }
}

#[test]
fn test_host_state_follows_greenlets() {
    set_host_context(Some(Rc::new(DepthHost)));
    DEPTH.set(7);

    let g = Greenlet::new(|_| {
        let at_start = DEPTH.get();
        DEPTH.set(3);
        parent().switch(args![at_start])?;
        Ok(Values::one(DEPTH.get()))
    });

    let at_start = g.switch(args![]).unwrap().into_one::<u32>();
    assert_eq!(at_start, Some(0));
    assert_eq!(DEPTH.get(), 7);

    DEPTH.set(8);
    let inside = g.switch(args![]).unwrap().into_one::<u32>();
    assert_eq!(inside, Some(3));
    assert_eq!(DEPTH.get(), 8);

    set_host_context(None);
}

/// Every snapshot holds a clone of `token`, so its strong count tracks how
/// many snapshots are alive.
struct CountingHost {
    token: Arc<()>,
}

impl HostContext for CountingHost {
    fn snapshot(&self) -> HostSnapshot {
        HostSnapshot::new(self.token.clone())
    }

    fn restore(&self, snapshot: HostSnapshot) {
        drop(snapshot);
    }

    fn reset(&self) {}
}

#[test]
fn test_finished_greenlet_keeps_no_host_snapshot() {
    let token = Arc::new(());
    set_host_context(Some(Rc::new(CountingHost { token: token.clone() })));

    let g = Greenlet::new(|_| Ok(Values::Empty));
    g.switch(args![]).unwrap();
    assert!(g.is_dead());
    // The host's own clone plus ours.
    assert_eq!(Arc::strong_count(&token), 2);

    set_host_context(None);
    assert_eq!(Arc::strong_count(&token), 1);
}

// ============================================================================
// STACK POOL
// ============================================================================

#[test]
fn test_finished_stacks_are_reused() {
    let warm = Greenlet::new(|_| Ok(Values::Empty));
    warm.switch(args![]).unwrap();
    let before = pool_stats();
    assert!(before.cached >= 1);

    for i in 0..200_u32 {
        let g = Greenlet::new(move |_| Ok(Values::one(i)));
        assert_eq!(g.switch(args![]).unwrap().into_one::<u32>(), Some(i));
    }

    let after = pool_stats();
    assert_eq!(after.allocated, before.allocated);
    assert_eq!(after.reused, before.reused + 200);
    assert_eq!(after.cached, before.cached);
}

#[test]
fn test_nested_greenlets_each_get_a_stack() {
    let outer = Greenlet::new(|_| {
        let inner = Greenlet::new(|_| Ok(Values::one(current().id())));
        let inner_id = inner.switch(args![])?.into_one::<GreenletId>().unwrap();
        Ok(Values::one((current().id(), inner_id)))
    });
    let before = pool_stats();
    let (outer_id, inner_id) = outer
        .switch(args![])
        .unwrap()
        .into_one::<(GreenletId, GreenletId)>()
        .unwrap();
    assert_ne!(outer_id, inner_id);

    let after = pool_stats();
    assert_eq!(
        (after.allocated + after.reused) - (before.allocated + before.reused),
        2
    );
}
