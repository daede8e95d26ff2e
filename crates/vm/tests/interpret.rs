//! End-to-end interpreter tests: each one compiles and runs a program
//! against a VM whose output is captured.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use lox_vm::{InterpretError, Vm, VmOptions};

#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run_with_options(source: &str, options: VmOptions) -> (Result<(), InterpretError>, String) {
    let buf = SharedBuf::default();
    let mut vm = Vm::with_output(options, Box::new(buf.clone()));
    let result = vm.interpret(source, false);
    let output = String::from_utf8(buf.0.borrow().clone()).expect("utf8 output");
    (result, output)
}

fn run_ok(source: &str) -> String {
    let (result, output) = run_with_options(source, VmOptions::default());
    if let Err(error) = result {
        panic!("program failed: {}\noutput so far: {}", error, output);
    }
    output
}

fn run_err(source: &str) -> String {
    let (result, _) = run_with_options(source, VmOptions::default());
    match result {
        Ok(()) => panic!("expected a runtime error for {:?}", source),
        Err(error) => error.to_string(),
    }
}

// ----------------------------------------------------------------------
// Expressions and statements
// ----------------------------------------------------------------------

#[test]
fn test_arithmetic_and_printing() {
    assert_eq!(run_ok("print 1 + 2 * 3;"), "7\n");
    assert_eq!(run_ok("print (1 + 2) * 3;"), "9\n");
    assert_eq!(run_ok("print 10 / 4;"), "2.5\n");
    assert_eq!(run_ok("print -(3 - 5);"), "2\n");
    assert_eq!(run_ok("print +4;"), "4\n");
    assert_eq!(run_ok("print !nil; print !0;"), "true\nfalse\n");
}

#[test]
fn test_ieee_division_semantics() {
    assert_eq!(run_ok("print 1 / 0;"), "inf\n");
    assert_eq!(run_ok("print -1 / 0;"), "-inf\n");
    assert_eq!(run_ok("print 0 / 0 == 0 / 0;"), "false\n");
}

#[test]
fn test_equality_and_comparison() {
    assert_eq!(run_ok("print 1 == 1; print 1 != 2;"), "true\ntrue\n");
    assert_eq!(run_ok("print nil == false;"), "false\n");
    assert_eq!(run_ok("print 2 < 3; print 2 <= 2; print 3 > 2; print 2 >= 3;"),
        "true\ntrue\ntrue\nfalse\n");
    assert_eq!(run_ok("print \"a\" + \"b\" == \"ab\";"), "true\n");
    assert_eq!(run_ok("print [1, 2] == [1, 2];"), "false\n");
}

#[test]
fn test_ternary_and_elvis() {
    assert_eq!(run_ok("print true ? 1 : 2;"), "1\n");
    assert_eq!(run_ok("print false ? 1 : 2;"), "2\n");
    assert_eq!(run_ok("print nil ?: 3;"), "3\n");
    assert_eq!(run_ok("print 7 ?: 3;"), "7\n");
}

#[test]
fn test_short_circuit_laws() {
    let output = run_ok(
        "var called = false;\n\
         fun effect() { called = true; return true; }\n\
         var r = false and effect();\n\
         print called;\n\
         r = true or effect();\n\
         print called;\n\
         r = false or effect();\n\
         print called;\n",
    );
    assert_eq!(output, "false\nfalse\ntrue\n");
}

#[test]
fn test_compound_assignment_on_all_targets() {
    assert_eq!(
        run_ok("var x = 10; x += 5; x -= 3; x *= 2; x /= 4; print x;"),
        "6\n"
    );
    assert_eq!(
        run_ok("class Box { init() { this.v = 1; } } var b = Box(); b.v += 9; print b.v;"),
        "10\n"
    );
    assert_eq!(run_ok("var a = [1, 2]; a[0] += 41; print a[0];"), "42\n");
}

#[test]
fn test_while_and_for_counts() {
    assert_eq!(
        run_ok("var n = 0; while (n < 5) { n = n + 1; } print n;"),
        "5\n"
    );
    assert_eq!(
        run_ok("var count = 0; for (var i = 0; i < 5; i = i + 1) count = count + 1; print count;"),
        "5\n"
    );
}

#[test]
fn test_break_and_continue() {
    let output = run_ok(
        "var total = 0;\n\
         for (var i = 0; i < 10; i = i + 1) {\n\
             if (i == 3) continue;\n\
             if (i == 5) break;\n\
             total = total + i;\n\
         }\n\
         print total;\n",
    );
    assert_eq!(output, "7\n");

    assert_eq!(
        run_ok("var n = 0; while (true) { n = n + 1; if (n == 3) break; } print n;"),
        "3\n"
    );
    assert_eq!(run_ok("for (;;) { break; } print \"done\";"), "done\n");
}

// ----------------------------------------------------------------------
// Functions and closures
// ----------------------------------------------------------------------

#[test]
fn test_function_calls_and_returns() {
    assert_eq!(
        run_ok("fun add(a, b) { return a + b; } print add(1, 2);"),
        "3\n"
    );
    assert_eq!(
        run_ok("fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);"),
        "55\n"
    );
    assert_eq!(run_ok("fun noop() {} print noop();"), "nil\n");
}

#[test]
fn test_counter_closure_keeps_private_state() {
    let output = run_ok(
        "fun makeCounter() {\n\
             var count = 0;\n\
             return fun () { count = count + 1; return count; };\n\
         }\n\
         var c = makeCounter();\n\
         print c(); print c();\n\
         var d = makeCounter();\n\
         print d(); print c();\n",
    );
    assert_eq!(output, "1\n2\n1\n3\n");
}

#[test]
fn test_closures_over_loop_variable_get_fresh_bindings() {
    let output = run_ok(
        "var fns = [];\n\
         for (var i = 0; i < 3; i = i + 1) fns.append(fun () { return i; });\n\
         print fns[0](); print fns[1](); print fns[2]();\n",
    );
    assert_eq!(output, "0\n1\n2\n");
}

#[test]
fn test_lambda_single_expression_body() {
    assert_eq!(run_ok("var double = fun (n) { n * 2 }; print double(21);"), "42\n");
    assert_eq!(run_ok("print string(fun (n) { n });"), "<fn lambda1>\n");
}

// ----------------------------------------------------------------------
// Classes
// ----------------------------------------------------------------------

#[test]
fn test_fields_and_methods() {
    let output = run_ok(
        "class Point {\n\
             init(x, y) { this.x = x; this.y = y; }\n\
             sum() { return this.x + this.y; }\n\
         }\n\
         var p = Point(3, 4);\n\
         print p.x; print p.sum();\n\
         p.x = 10; print p.sum();\n",
    );
    assert_eq!(output, "3\n7\n14\n");
}

#[test]
fn test_inheritance_and_super() {
    let output = run_ok(
        "class A { greet() { return \"A\"; } }\n\
         class B < A { greet() { return super.greet() + \"B\"; } }\n\
         print B().greet();\n",
    );
    assert_eq!(output, "AB\n");
}

#[test]
fn test_methods_copy_at_inherit_time() {
    let output = run_ok(
        "class A { hello() { return \"hi\"; } }\n\
         class B < A { }\n\
         print B().hello();\n",
    );
    assert_eq!(output, "hi\n");
}

#[test]
fn test_multiple_inheritance_later_wins() {
    let output = run_ok(
        "class A { who() { return \"A\"; } only() { return 1; } }\n\
         class B { who() { return \"B\"; } }\n\
         class C < [A, B] { }\n\
         print C().who(); print C().only();\n",
    );
    assert_eq!(output, "B\n1\n");
}

#[test]
fn test_super_with_explicit_class_selector() {
    let output = run_ok(
        "class A { greet() { return \"A\"; } }\n\
         class B { greet() { return \"B\"; } }\n\
         class C < [A, B] {\n\
             greet() { return super[A].greet() + super[B].greet(); }\n\
         }\n\
         print C().greet();\n",
    );
    assert_eq!(output, "AB\n");
}

#[test]
fn test_static_methods() {
    let output = run_ok(
        "class Math2 {\n\
             static twice(n) { return n * 2; }\n\
         }\n\
         print Math2.twice(21);\n\
         var f = Math2.twice;\n\
         print f(5);\n",
    );
    assert_eq!(output, "42\n10\n");
}

#[test]
fn test_bound_methods_remember_their_receiver() {
    let output = run_ok(
        "class Greeter {\n\
             init(name) { this.name = name; }\n\
             greet() { return \"hello \" + this.name; }\n\
         }\n\
         var m = Greeter(\"world\").greet;\n\
         print m();\n",
    );
    assert_eq!(output, "hello world\n");
}

#[test]
fn test_print_dispatches_to_user_to_string() {
    let output = run_ok(
        "class P {\n\
             init(n) { this.n = n; }\n\
             toString() { return \"P(${this.n})\"; }\n\
         }\n\
         print P(3);\n",
    );
    assert_eq!(output, "P(3)\n");
}

#[test]
fn test_constructor_arity_is_checked() {
    let error = run_err("class A {} A(1);");
    assert!(
        error.contains("<class A> initializer expected 0 arguments but got 1."),
        "{}",
        error
    );
}

// ----------------------------------------------------------------------
// Exceptions
// ----------------------------------------------------------------------

#[test]
fn test_try_throw_catch() {
    assert_eq!(
        run_ok("try { throw \"boom\"; } catch (e) { print e; }"),
        "boom\n"
    );
}

#[test]
fn test_throw_unwinds_nested_calls() {
    let output = run_ok(
        "fun boom() { throw \"inner\"; }\n\
         fun outer() { boom(); }\n\
         try { outer(); } catch (e) { print e; }\n\
         print \"after\";\n",
    );
    assert_eq!(output, "inner\nafter\n");
}

#[test]
fn test_nested_try_blocks() {
    let output = run_ok(
        "try {\n\
             try { throw 1; } catch (e) { print e; throw 2; }\n\
         } catch (e) { print e; }\n",
    );
    assert_eq!(output, "1\n2\n");
}

#[test]
fn test_try_reads_and_writes_enclosing_locals() {
    let output = run_ok(
        "{\n\
             var x = 1;\n\
             try { x = x + 1; } catch (e) { x = 99; }\n\
             print x;\n\
         }\n",
    );
    assert_eq!(output, "2\n");
}

#[test]
fn test_runtime_errors_are_catchable() {
    assert_eq!(
        run_ok("try { print missing; } catch (e) { print e; }"),
        "Exception: Undefined variable 'missing'.\n"
    );
    assert_eq!(
        run_ok("try { 4(); } catch (e) { print e; }"),
        "Exception: Object is not callable.\n"
    );
    assert_eq!(
        run_ok("fun f(a) {} try { f(1, 2); } catch (e) { print e; }"),
        "Exception: <fn f> expected 1 arguments but got 2.\n"
    );
}

#[test]
fn test_uncaught_throw_reports_line_per_frame() {
    let error = run_err("fun f() { throw \"x\"; }\nf();");
    assert_eq!(
        error,
        "Uncaught Exception: x\n[line 1] in f\n[line 2] in <script>"
    );
}

#[test]
fn test_uncaught_exception_object() {
    let error = run_err("throw Exception(\"bad\");");
    assert!(error.starts_with("Uncaught Exception: bad"), "{}", error);
}

#[test]
fn test_exception_payload_accessor() {
    assert_eq!(
        run_ok("try { throw Exception(42); } catch (e) { print e.payload(); }"),
        "42\n"
    );
}

// ----------------------------------------------------------------------
// Fatal errors
// ----------------------------------------------------------------------

#[test]
fn test_stack_overflow_is_fatal() {
    let error = run_err("fun f() { f(); } f();");
    assert!(error.starts_with("Stack overflow."), "{}", error);
}

#[test]
fn test_negating_a_non_number_is_fatal() {
    let error = run_err("-\"a\";");
    assert!(error.starts_with("Operand must be a number."), "{}", error);
}

#[test]
fn test_fatal_errors_are_not_catchable() {
    let error = run_err("fun f() { f(); } try { f(); } catch (e) { print e; }");
    assert!(error.starts_with("Stack overflow."), "{}", error);
}

// ----------------------------------------------------------------------
// Strings and interpolation
// ----------------------------------------------------------------------

#[test]
fn test_string_interpolation() {
    assert_eq!(run_ok("var x = 2; var y = 3; print \"x+y=${x+y}\";"), "x+y=5\n");
    assert_eq!(
        run_ok("print \"a${1}b${\"c\"}d\";"),
        "a1bcd\n"
    );
    assert_eq!(
        run_ok("var name = \"world\"; print \"hello ${name}!\";"),
        "hello world!\n"
    );
    assert_eq!(run_ok("print \"nested ${\"in ${40 + 2}\"}\";"), "nested in 42\n");
}

#[test]
fn test_string_methods() {
    assert_eq!(run_ok("print \"hello\".length();"), "5\n");
    assert_eq!(run_ok("print \"hello\".get(1);"), "e\n");
    assert_eq!(run_ok("print \"hello\".contains(\"ell\");"), "true\n");
    assert_eq!(run_ok("print \"hello\".get(Slice(1, 4, 1));"), "ell\n");
}

#[test]
fn test_string_operator_methods() {
    assert_eq!(run_ok("print \"a\" + 1;"), "a1\n");
    assert_eq!(run_ok("print \"b\" > \"a\"; print \"a\" < \"b\";"), "true\ntrue\n");
}

#[test]
fn test_operator_method_missing_on_other_builtins() {
    let error = run_err("1 + \"a\";");
    assert!(error.contains("Undefined property 'add'."), "{}", error);
}

// ----------------------------------------------------------------------
// Arrays, slices, hashmaps
// ----------------------------------------------------------------------

#[test]
fn test_array_subscript_and_slice() {
    let output = run_ok(
        "var a = [1, 2, 3, 4, 5];\n\
         print a[1];\n\
         a[1] = 20;\n\
         print a;\n\
         print a[Slice(1, 4, 1)];\n",
    );
    assert_eq!(output, "2\n[1, 20, 3, 4, 5]\n[20, 3, 4]\n");
}

#[test]
fn test_slice_defaults_and_negative_step() {
    assert_eq!(run_ok("print [1, 2, 3, 4][Slice(nil, nil, 1)];"), "[1, 2, 3, 4]\n");
    assert_eq!(run_ok("print [1, 2, 3, 4][Slice(nil, nil, -1)];"), "[4, 3, 2, 1]\n");
    assert_eq!(run_ok("print [1, 2, 3, 4, 5][Slice(nil, nil, 2)];"), "[1, 3, 5]\n");
}

#[test]
fn test_array_methods() {
    assert_eq!(
        run_ok("var a = [1]; a.append(2).append(3); print a; print a.length(); print a.pop(); print a;"),
        "[1, 2, 3]\n3\n3\n[1, 2]\n"
    );
}

#[test]
fn test_array_bounds_are_checked() {
    assert_eq!(
        run_ok("try { print [1][5]; } catch (e) { print e; }"),
        "Exception: Array index out of bounds.\n"
    );
    assert_eq!(
        run_ok("try { print [].pop(); } catch (e) { print e; }"),
        "Exception: Cannot pop from an empty array.\n"
    );
}

#[test]
fn test_slice_validation() {
    assert_eq!(
        run_ok("try { Slice(1, 2, 0); } catch (e) { print e; }"),
        "Exception: Slice step cannot be zero.\n"
    );
    assert_eq!(run_ok("print Slice(1, 4, 1);"), "Slice(1, 4, 1)\n");
    assert_eq!(run_ok("print Slice(1, 4, 1).start;"), "<fn start>\n");
    assert_eq!(run_ok("print Slice(1, 4, 1).end();"), "4\n");
}

#[test]
fn test_hashmap_operations() {
    let output = run_ok(
        "var m = Hashmap();\n\
         m.set(\"a\", 1);\n\
         m[\"b\"] = 2;\n\
         print m.get(\"a\");\n\
         print m[\"b\"];\n\
         print m.get(\"missing\");\n\
         print m.has(\"a\");\n\
         print m.length();\n\
         print m.remove(\"a\");\n\
         print m.has(\"a\");\n",
    );
    assert_eq!(output, "1\n2\nnil\ntrue\n2\ntrue\nfalse\n");
}

#[test]
fn test_hashmap_value_keys() {
    let output = run_ok(
        "var m = Hashmap();\n\
         m.set(1, \"one\");\n\
         m.set(true, \"yes\");\n\
         m.set(nil, \"nothing\");\n\
         print m.get(1); print m.get(true); print m.get(nil);\n",
    );
    assert_eq!(output, "one\nyes\nnothing\n");
}

// ----------------------------------------------------------------------
// Natives and sentinel routing
// ----------------------------------------------------------------------

#[test]
fn test_global_natives() {
    assert_eq!(run_ok("print clock() > 0;"), "true\n");
    assert_eq!(run_ok("print string(12); print string(nil); print string(true);"), "12\nnil\ntrue\n");
    assert_eq!(run_ok("print concatenate(\"a\", \"b\", \"c\");"), "abc\n");
    assert_eq!(run_ok("print type(1);"), "<class Number>\n");
    assert_eq!(run_ok("print type(\"s\");"), "<class String>\n");
    assert_eq!(run_ok("class A {} print type(A()) == A;"), "true\n");
    assert_eq!(
        run_ok("print hasMethod([1], \"append\"); print hasMethod(1, \"floor\"); print hasMethod(1, \"nope\");"),
        "true\ntrue\nfalse\n"
    );
}

#[test]
fn test_number_methods() {
    assert_eq!(run_ok("print 3.7.floor(); print 3.2.ceil();"), "3\n4\n");
    assert_eq!(run_ok("print (0 - 5).abs(); print 2.25.sqrt();"), "5\n1.5\n");
}

#[test]
fn test_function_sentinel_methods() {
    assert_eq!(run_ok("fun f(a, b) {} print f.name(); print f.arity();"), "<fn f>\n2\n");
}

#[test]
fn test_globals_shadow_stl() {
    assert_eq!(run_ok("var clock = 7; print clock;"), "7\n");
}

#[test]
fn test_undefined_method_on_primitive() {
    let error = run_err("true.frob();");
    assert!(error.contains("Undefined property 'frob'."), "{}", error);
}

#[test]
fn test_nil_has_no_methods() {
    let error = run_err("nil.frob();");
    assert!(error.contains("Object does not have methods."), "{}", error);
}

// ----------------------------------------------------------------------
// REPL expression evaluation
// ----------------------------------------------------------------------

#[test]
fn test_eval_expr_mode_prints_non_nil_values() {
    let buf = SharedBuf::default();
    let mut vm = Vm::with_output(VmOptions::default(), Box::new(buf.clone()));
    vm.interpret("1 + 2;", true).expect("line 1");
    vm.interpret("var x = 5;", true).expect("line 2");
    vm.interpret("x;", true).expect("line 3");
    vm.interpret("nil;", true).expect("line 4");
    let output = String::from_utf8(buf.0.borrow().clone()).expect("utf8");
    assert_eq!(output, "3\n5\n");
}

#[test]
fn test_globals_persist_across_interpret_calls() {
    let buf = SharedBuf::default();
    let mut vm = Vm::with_output(VmOptions::default(), Box::new(buf.clone()));
    vm.interpret("var total = 1;", false).expect("define");
    vm.interpret("total = total + 41;", false).expect("update");
    vm.interpret("print total;", false).expect("print");
    let output = String::from_utf8(buf.0.borrow().clone()).expect("utf8");
    assert_eq!(output, "42\n");
}

#[test]
fn test_vm_recovers_after_runtime_error() {
    let buf = SharedBuf::default();
    let mut vm = Vm::with_output(VmOptions::default(), Box::new(buf.clone()));
    assert!(vm.interpret("throw \"boom\";", false).is_err());
    vm.interpret("print \"still alive\";", false).expect("second run");
    let output = String::from_utf8(buf.0.borrow().clone()).expect("utf8");
    assert_eq!(output, "still alive\n");
}

#[test]
fn test_extended_falseness_is_opt_in() {
    assert_eq!(run_ok("print 0 ? 1 : 2; print \"\" ?: 3;"), "1\n\n");

    let options = VmOptions {
        extended_falseness: true,
        ..Default::default()
    };
    let (result, output) =
        run_with_options("print 0 ? 1 : 2; print \"\" ?: 3; print 1 ? 4 : 5;", options);
    assert!(result.is_ok());
    assert_eq!(output, "2\n3\n4\n");
}

// ----------------------------------------------------------------------
// Collector stress
// ----------------------------------------------------------------------

#[test]
fn test_gc_logging_goes_to_stderr_only() {
    // Allocation/free/cycle logging must never leak into program output.
    let options = VmOptions {
        log_gc: true,
        stress_gc: true,
        ..Default::default()
    };
    let (result, output) = run_with_options("print \"quiet\" + \"!\";", options);
    assert!(result.is_ok());
    assert_eq!(output, "quiet!\n");
}

#[test]
fn test_gc_stress_mode_preserves_semantics() {
    let options = VmOptions {
        stress_gc: true,
        ..Default::default()
    };
    let source = "var fns = [];\n\
                  for (var i = 0; i < 3; i = i + 1) fns.append(fun () { return i; });\n\
                  print fns[0](); print fns[1](); print fns[2]();\n\
                  var s = \"\";\n\
                  for (var j = 0; j < 20; j = j + 1) s = s + \"x${j}\";\n\
                  print s.length();\n\
                  class A { init(n) { this.n = n; } get() { return this.n; } }\n\
                  print A(7).get();\n";
    let (result, output) = run_with_options(source, options);
    assert!(result.is_ok(), "{:?}", result.err().map(|e| e.to_string()));
    let expected_len: usize = (0..20).map(|j| format!("x{}", j).len()).sum();
    assert_eq!(
        output,
        format!("0\n1\n2\n{}\n7\n", expected_len)
    );
}

#[test]
fn test_compile_errors_reported_not_run() {
    let (result, output) = run_with_options("print 1", VmOptions::default());
    match result {
        Err(InterpretError::Compile(errors)) => {
            assert_eq!(errors.len(), 1);
            assert!(errors[0].to_string().contains("Expect ';' after value."));
        }
        other => panic!("expected a compile error, got {:?}", other.err().map(|e| e.to_string())),
    }
    assert_eq!(output, "");
}
