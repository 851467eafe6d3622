//! Bytecode compiler and stack-based virtual machine.
//!
//! [`interpret`] is the single public entry point: it compiles `source`
//! and runs the result against a fresh [`Vm`]. Embedders that want a
//! persistent global environment across calls (a REPL) should construct
//! their own [`Vm`] and call [`Vm::interpret`] repeatedly instead.

pub mod chunk;
pub mod compiler;
pub mod error;
pub mod memory;
pub mod opcode;
pub mod stdlib;
pub mod table;
pub mod value;
pub mod vm;

pub use error::{CompileError, InterpretError, InterpretResult, RuntimeError};
pub use value::Value;
pub use vm::Vm;

/// Compiles and runs `source` in a fresh VM, returning the coarse
/// three-way result the CLI dispatches its process exit code on.
pub fn interpret(source: &str) -> InterpretResult {
    let mut vm = Vm::new();
    match vm.interpret(source) {
        Ok(()) => InterpretResult::Ok,
        Err(e) => InterpretResult::from(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Runs `src` against a fresh VM, asserting it succeeds.
    fn r(src: &str) {
        let mut vm = Vm::new();
        match vm.interpret(src) {
            Ok(()) => {}
            Err(InterpretError::Compile(errors)) => {
                panic!("unexpected compile error(s): {errors:?}")
            }
            Err(InterpretError::Runtime(e)) => panic!("unexpected runtime error: {}", e.message),
        }
    }

    /// Runs `src`, asserting it fails with a runtime error whose message
    /// equals `expected`.
    fn r_err(src: &str, expected: &str) {
        let mut vm = Vm::new();
        match vm.interpret(src) {
            Ok(()) => panic!("expected a runtime error, got success"),
            Err(InterpretError::Runtime(e)) => assert_eq!(e.message, expected),
            Err(InterpretError::Compile(errors)) => {
                panic!("expected a runtime error, got compile error(s): {errors:?}")
            }
        }
    }

    /// Runs `src`, asserting it fails to compile.
    fn compile_err(src: &str) {
        let mut vm = Vm::new();
        match vm.interpret(src) {
            Ok(()) => panic!("expected a compile error, got success"),
            Err(InterpretError::Compile(_)) => {}
            Err(InterpretError::Runtime(e)) => {
                panic!("expected a compile error, got runtime error: {}", e.message)
            }
        }
    }

    #[test]
    fn test_arithmetic_precedence() {
        r("if (1 + 2 * 3 != 7) { var x = 1 / 0; } print 1 + 2 * 3;");
    }

    #[test]
    fn test_string_concatenation_and_interning() {
        r(r#"
            var a = "foo" + "bar";
            var b = "foo" + "bar";
            if (a != "foobar") { var x = nil + nil; }
            print a;
        "#);
    }

    #[test]
    fn test_fibonacci() {
        r(r#"
            fun fib(n) {
                if (n < 2) return n;
                return fib(n - 1) + fib(n - 2);
            }
            if (fib(10) != 55) { var x = nil + nil; }
        "#);
    }

    #[test]
    fn test_closures_share_upvalue() {
        r(r#"
            fun makeCounter() {
                var i = 0;
                fun count() {
                    i = i + 1;
                    return i;
                }
                return count;
            }
            var counter = makeCounter();
            if (counter() != 1) { var x = nil + nil; }
            if (counter() != 2) { var x = nil + nil; }
            if (counter() != 3) { var x = nil + nil; }
        "#);
    }

    #[test]
    fn test_scope_shadowing() {
        r(r#"
            var a = 1;
            {
                var a = 2;
                print a;
            }
            print a;
        "#);
    }

    #[test]
    fn test_class_init_and_method() {
        r(r#"
            class Box {
                init(value) {
                    this.value = value;
                }
                doubled() {
                    return this.value * 2;
                }
            }
            var b = Box(7);
            if (b.doubled() != 14) { var x = nil + nil; }
        "#);
    }

    #[test]
    fn test_inheritance_and_super() {
        r(r#"
            class Animal {
                speak() {
                    return "...";
                }
            }
            class Dog < Animal {
                speak() {
                    return "Woof " + super.speak();
                }
            }
            var d = Dog();
            print d.speak();
        "#);
    }

    #[test]
    fn test_add_number_and_string_is_runtime_error() {
        r_err("1 + \"x\";", "Operands must be two numbers or two strings.");
    }

    #[test]
    fn test_undefined_variable_is_runtime_error() {
        r_err("print undefined_name;", "Undefined variable 'undefined_name'.");
    }

    #[test]
    fn test_missing_initializer_expression_is_compile_error() {
        compile_err("var a = ;");
    }

    #[test]
    fn test_clock_native_returns_number() {
        r("var t = clock(); if (t < 0) { var x = nil + nil; }");
    }
}
