//! Compiler-level tests: programs that must compile, programs that must not,
//! and the stability of emitted code across runs.

use lox_compiler::{CompileOptions, compile};
use lox_core::debug::disassemble_chunk;
use lox_core::heap::Heap;

fn compiles(source: &str) -> bool {
    let mut heap = Heap::new();
    compile(&mut heap, source, CompileOptions::default()).is_ok()
}

fn first_error(source: &str) -> String {
    let mut heap = Heap::new();
    match compile(&mut heap, source, CompileOptions::default()) {
        Ok(_) => panic!("expected a compile error for {:?}", source),
        Err(errors) => errors[0].to_string(),
    }
}

#[test]
fn test_well_formed_programs_compile() {
    for source in [
        "var a = 1; print a;",
        "fun f(a, b) { return a + b; } print f(1, 2);",
        "class A { init(n) { this.n = n; } get() { return this.n; } }",
        "class B < A { get() { return super.get(); } }",
        "class C < [A, B] { }",
        "class D { static make() { return D(); } }",
        "for (var i = 0; i < 10; i = i + 1) { if (i == 5) break; else continue; }",
        "while (true) { break; }",
        "var t = true ? 1 : 2; var e = nil ?: 3;",
        "try { throw \"x\"; } catch (e) { print e; }",
        "var xs = [1, 2, 3]; xs[0] = xs[1] + xs[2]; xs[0] += 1;",
        "var f = fun (n) { n * 2 }; print f(21);",
        "print \"x+y=${1 + 2}\";",
        "var o = A(1); o.n = 2; o.n += 3; print o.n;",
        "fun outer() { var x = 1; fun inner() { x = x + 1; return x; } return inner; }",
        "print 1 + 2 * 3 - 4 / -2; print !(1 == 2) and true or false;",
    ] {
        let mut heap = Heap::new();
        let result = compile(&mut heap, source, CompileOptions::default());
        assert!(result.is_ok(), "failed to compile {:?}: {:?}", source, result.err());
    }
}

#[test]
fn test_error_format() {
    assert_eq!(
        first_error("var 1 = 2;"),
        "[line 1] Error at '1': Expect variable name."
    );
    assert_eq!(
        first_error("print 1"),
        "[line 1] Error at end: Expect ';' after value."
    );
}

#[test]
fn test_invalid_assignment_target() {
    let error = first_error("1 + 2 = 3;");
    assert!(error.contains("Invalid assignment target."), "{}", error);
    let error = first_error("a * b += 1;");
    assert!(error.contains("Invalid assignment target."), "{}", error);
}

#[test]
fn test_scope_errors() {
    assert!(first_error("{ var a = 1; var a = 2; }").contains("Already a variable"));
    assert!(first_error("{ var a = a; }").contains("its own initializer"));
    assert!(first_error("return 1;").contains("Cannot return from top-level code."));
    assert!(first_error("break;").contains("outside of a loop"));
    assert!(first_error("continue;").contains("outside of a loop"));
}

#[test]
fn test_class_context_errors() {
    assert!(first_error("print this;").contains("Cannot use 'this' outside of a class."));
    assert!(first_error("class A { f() { return super.f(); } }")
        .contains("Cannot use 'super' in a class with no superclass."));
    assert!(first_error("fun f() { return super.x; }")
        .contains("Cannot use 'super' outside of a class."));
    assert!(first_error("class A {} class B {} class C < [A, B] { f() { return super.f(); } }")
        .contains("use 'super[Class]'"));
    assert!(first_error("class A { static init() {} }")
        .contains("Initializer cannot be a static method."));
    assert!(first_error("class A { f() { static g() {} } }").contains("Expect"));
}

#[test]
fn test_scanner_errors_surface_as_compile_errors() {
    assert!(first_error("var s = \"oops;").contains("Unterminated string."));
    assert!(first_error("}").contains("Unmatched '}'."));
    assert!(first_error("/* no close").contains("Unterminated block comment."));
}

#[test]
fn test_panic_mode_recovers_and_reports_later_errors() {
    let mut heap = Heap::new();
    let errors = compile(
        &mut heap,
        "var 1;\nvar x = 2;\nreturn 3;\n",
        CompileOptions::default(),
    )
    .unwrap_err();
    // One error per statement that is actually wrong, not a cascade.
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].line, 1);
    assert_eq!(errors[1].line, 3);
}

#[test]
fn test_too_many_constants_in_one_chunk() {
    // 257 distinct number constants overflow the one-byte operand.
    let mut source = String::new();
    for i in 0..257 {
        source.push_str(&format!("var v{} = {}.5;\n", i, i));
    }
    let error = first_error(&source);
    assert!(error.contains("Too many constants in one chunk."), "{}", error);
}

#[test]
fn test_constant_dedup_shares_slots() {
    // The same literal and identifier reused many times stays within the
    // one-byte constant operand range.
    let mut source = String::new();
    for _ in 0..300 {
        source.push_str("var x = 1; x = x + 1;\n");
    }
    assert!(compiles(&source));
}

#[test]
fn test_disassembly_is_stable_across_runs() {
    let source = r#"
        fun adder(n) {
            return fun (m) { n + m };
        }
        var add2 = adder(2);
        print add2(40);
        print "n=${add2(0)}";
    "#;

    let mut first = Heap::new();
    let function = compile(&mut first, source, CompileOptions::default()).unwrap();
    let listing_a = disassemble_chunk(&function.chunk, "script");

    let mut second = Heap::new();
    let function = compile(&mut second, source, CompileOptions::default()).unwrap();
    let listing_b = disassemble_chunk(&function.chunk, "script");

    assert_eq!(listing_a, listing_b);
}

#[test]
fn test_eval_expr_mode_only_changes_top_level_expressions() {
    let options = CompileOptions {
        eval_expr: true,
        print_code: false,
    };
    let mut heap = Heap::new();
    assert!(compile(&mut heap, "1 + 2; fun f() { 1 + 2; } { 3; }", options).is_ok());
}
