//! End-to-end scenarios (spec §8: "concrete end-to-end scenarios").
//!
//! Each test drives a full `ember_vm::Vm` through `eval`, the same path a
//! host embedding this crate would use. `print` output is captured through a
//! thread-local buffer rather than redirecting real stdout, since natives
//! are plain `fn` pointers with no closure environment to carry a channel.

use std::cell::RefCell;

use ember_core::{Result, Value};
use ember_vm::{install_stdlib, Vm};

thread_local! {
    static CAPTURED: RefCell<Vec<String>> = RefCell::new(Vec::new());
}

fn capture_print(vm: &mut Vm, args: &[Value]) -> Result<Value> {
    let heap = vm.heap();
    let line = args.iter().map(|v| v.print(heap)).collect::<Vec<_>>().join(" ");
    CAPTURED.with(|c| c.borrow_mut().push(line));
    Ok(Value::Nil)
}

fn take_output() -> Vec<String> {
    CAPTURED.with(|c| c.borrow_mut().drain(..).collect())
}

fn vm_with_capture() -> Vm {
    let mut vm = Vm::new();
    install_stdlib(&mut vm);
    vm.register_native("print", capture_print);
    vm
}

#[test]
fn arithmetic_precedence() {
    let mut vm = vm_with_capture();
    vm.eval("print(2 + 3 * 4);").unwrap();
    assert_eq!(take_output(), vec!["14"]);
}

#[test]
fn break_exits_a_while_loop() {
    let mut vm = vm_with_capture();
    vm.eval(
        "let i = 0; \
         while (i < 10) { \
             if (i == 3) { break; } \
             i = i + 1; \
         } \
         print(i);",
    )
    .unwrap();
    assert_eq!(take_output(), vec!["3"]);
}

#[test]
fn try_catch_finally_runs_both_handlers() {
    let mut vm = vm_with_capture();
    vm.eval(
        "try { throw \"oops\"; } \
         catch (e) { print(e); } \
         finally { print(\"done\"); }",
    )
    .unwrap();
    assert_eq!(take_output(), vec!["oops", "done"]);
}

#[test]
fn break_inside_try_still_runs_finally() {
    let mut vm = vm_with_capture();
    vm.eval(
        "let i = 0; \
         while (i < 5) { \
             try { \
                 if (i == 2) { break; } \
                 print(i); \
             } catch (e) { \
             } finally { \
                 print(\"cleanup\"); \
             } \
             i = i + 1; \
         } \
         print(\"after\");",
    )
    .unwrap();
    assert_eq!(
        take_output(),
        vec!["0", "cleanup", "1", "cleanup", "cleanup", "after"],
    );
}

#[test]
fn return_inside_try_still_runs_finally() {
    let mut vm = vm_with_capture();
    vm.eval(
        "fn f() { \
             try { \
                 return 42; \
             } catch (e) { \
             } finally { \
                 print(\"cleanup\"); \
             } \
         } \
         print(f());",
    )
    .unwrap();
    assert_eq!(take_output(), vec!["cleanup", "42"]);
}

#[test]
fn break_inside_try_does_not_leave_a_stale_handler() {
    // The break leaves the try (and its handler) behind; a later, unrelated
    // throw in the same frame must not be caught by it.
    let mut vm = vm_with_capture();
    let result = vm.eval(
        "while (true) { \
             try { break; } catch (e) { print(\"wrongly caught\"); } \
         } \
         throw \"real\";",
    );
    assert!(result.is_err(), "the throw after the loop should propagate uncaught");
    assert!(take_output().is_empty(), "the stale handler must not have intercepted it");
}

#[test]
fn rethrow_inside_catch_still_runs_its_own_finally() {
    let mut vm = vm_with_capture();
    let result = vm.eval(
        "try { \
             throw \"first\"; \
         } catch (e) { \
             print(\"caught \" + e); \
             throw \"second\"; \
         } finally { \
             print(\"cleanup\"); \
         }",
    );
    assert!(result.is_err(), "the rethrown exception should propagate out uncaught");
    assert_eq!(take_output(), vec!["caught first", "cleanup"]);
}

#[test]
fn c_style_for_loop_sums_to_expected_total() {
    let mut vm = vm_with_capture();
    vm.eval(
        "let sum = 0; \
         for (let i = 0; i < 5; i = i + 1) { \
             sum = sum + i; \
         } \
         print(sum); # 0+1+2+3+4",
    )
    .unwrap();
    assert_eq!(take_output(), vec!["10"]);
}

#[test]
fn class_instance_field_round_trip() {
    let mut vm = vm_with_capture();
    vm.eval(
        "class P { fn init(v) { this.v = v; } } \
         let p = new P(7); \
         print(p.v);",
    )
    .unwrap();
    assert_eq!(take_output(), vec!["7"]);
}

#[test]
fn vfs_denies_traversal_then_allows_a_mounted_path() {
    let mut vm = vm_with_capture();

    // Escaping the /app mount is denied: read_file returns nil, never raises.
    vm.eval("print(read_file(\"/app/../etc/passwd\"));").unwrap();
    assert_eq!(take_output(), vec!["nil"]);

    // Writing, then reading back, a path inside the mount succeeds.
    vm.eval(
        "write_file(\"/app/existing.txt\", \"hello vfs\"); \
         print(read_file(\"/app/existing.txt\"));",
    )
    .unwrap();
    assert_eq!(take_output(), vec!["hello vfs"]);

    vm.vfs_mut().remove_file("/app/existing.txt");
}

#[test]
fn gc_reclaims_short_lived_arrays() {
    let mut vm = Vm::new();
    vm.eval(
        "fn make_array() { return [1, 2, 3]; } \
         let i = 0; \
         while (i < 10000) { make_array(); i = i + 1; }",
    )
    .unwrap();

    let stats = vm.collect_garbage();
    assert!(
        stats.live < 50,
        "expected the 10,000 short-lived arrays to be long gone, live={}",
        stats.live
    );
}
