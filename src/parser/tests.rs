//! Parser tests.

use pretty_assertions::assert_eq;

use crate::ast::*;
use crate::lexer::Scanner;
use crate::parser::Parser;

fn parse(source: &str) -> Program {
    let tokens = Scanner::new(source).scan_tokens().unwrap();
    Parser::new(tokens).parse().unwrap()
}

fn parse_expr(source: &str) -> Expr {
    parse(source).value.expect("expected a trailing expression")
}

fn render(source: &str) -> String {
    parse_expr(source).to_string()
}

#[test]
fn test_binary_expr() {
    let expr = parse_expr("1 + 2");
    match expr.kind {
        ExprKind::Binary { operator, .. } => assert_eq!(operator, BinaryOp::Add),
        _ => panic!("Expected binary expression"),
    }
}

#[test]
fn test_precedence() {
    assert_eq!(render("1 + 2 * 3"), "(1 + (2 * 3))");
    assert_eq!(render("1 - 2 - 3"), "((1 - 2) - 3)");
    assert_eq!(render("2 ** 3 ** 2"), "(2 ** (3 ** 2))");
    assert_eq!(render("a || b && c == d"), "(a || (b && (c == d)))");
    assert_eq!(render("1 | 2 ^ 3 & 4 << 1"), "(1 | (2 ^ (3 & (4 << 1))))");
    assert_eq!(render("!a == b"), "((!a) == b)");
}

#[test]
fn test_negative_literal_folding() {
    assert_eq!(
        parse_expr("-2147483648").kind,
        ExprKind::Literal(Literal::Int32(i32::MIN))
    );
    assert_eq!(render("-x"), "(-x)");
}

#[test]
fn test_int_literal_out_of_range() {
    let tokens = Scanner::new("2147483648").scan_tokens().unwrap();
    assert!(Parser::new(tokens).parse().is_err());
}

#[test]
fn test_call_index_and_field() {
    assert_eq!(render("f(1, 2)[0].1"), "f(1, 2)[0].1");
    let expr = parse_expr("foo(1, 2)");
    match expr.kind {
        ExprKind::Call { arguments, .. } => assert_eq!(arguments.len(), 2),
        _ => panic!("Expected call expression"),
    }
}

#[test]
fn test_tuples_and_grouping() {
    assert_eq!(render("(1, \"a\")"), "(1, \"a\")");
    assert!(matches!(parse_expr("(1)").kind, ExprKind::Grouping(_)));
    assert!(matches!(parse_expr("()").kind, ExprKind::Tuple(ref v) if v.is_empty()));
}

#[test]
fn test_lambda() {
    let expr = parse_expr("|x, y: Int32| x + y");
    let ExprKind::Lambda(decl) = expr.kind else {
        panic!("Expected lambda");
    };
    assert_eq!(decl.params.len(), 2);
    assert!(decl.params[0].type_annotation.is_none());
    assert_eq!(decl.params[1].type_annotation.as_ref().unwrap().to_string(), "Int32");
    assert_eq!(decl.body.to_string(), "(x + y)");
}

#[test]
fn test_lambda_return_type_and_empty_params() {
    assert_eq!(render("|| -> Int32 5"), "|| -> Int32 5");
    assert_eq!(render("fn(a: Int32) a"), "|a: Int32| a");
}

#[test]
fn test_if_else_chain() {
    assert_eq!(
        render("if a { 1 } else if b { 2 } else { 3 }"),
        "if a { 1 } else if b { 2 } else { 3 }"
    );
}

#[test]
fn test_declarations() {
    let program = parse("fn add(a: Int32, b: Int32) -> Int32 { a + b } let inc = |x| add(x, 1); inc(2)");
    assert_eq!(program.statements.len(), 2);
    match &program.statements[1].kind {
        StmtKind::Let {
            name, initializer, ..
        } => {
            assert_eq!(name, "inc");
            let ExprKind::Lambda(decl) = &initializer.kind else {
                panic!("Expected lambda initializer");
            };
            assert_eq!(decl.name, "inc");
        }
        _ => panic!("Expected let"),
    }
    assert_eq!(program.value.unwrap().to_string(), "inc(2)");
}

#[test]
fn test_trailing_semicolon_has_no_value() {
    let program = parse("1 + 2;");
    assert_eq!(program.statements.len(), 1);
    assert!(program.value.is_none());
}

#[test]
fn test_block_value() {
    assert_eq!(render("{ let a = 1; a }"), "{ let a = 1; a }");
}

#[test]
fn test_types() {
    let program = parse("let f: fn([Int32], (Bool, Char)) -> String = g;");
    match &program.statements[0].kind {
        StmtKind::Let {
            type_annotation: Some(ty),
            ..
        } => assert_eq!(ty.to_string(), "fn([Int32], (Bool, Char)) -> String"),
        _ => panic!("Expected annotated let"),
    }
}

#[test]
fn test_missing_semicolon() {
    let tokens = Scanner::new("1 2").scan_tokens().unwrap();
    assert!(Parser::new(tokens).parse().is_err());
}
