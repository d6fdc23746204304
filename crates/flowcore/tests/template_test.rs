// crates/flowcore/tests/template_test.rs

use flowcore::template::{render, resolve_template, resolve_value, template_scope};
use flowcore::value::{compare_values, get_path, loose_eq, parse_path, select_path, PathSegment};
use flowcore::{ExecutionContext, ExecutionId};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::HashMap;
use uuid::Uuid;

fn create_test_context() -> ExecutionContext {
    let mut ctx = ExecutionContext::new(ExecutionId::new_v4(), Uuid::new_v4(), "user-9")
        .with_variables(HashMap::from([
            ("city".to_string(), json!("Lisbon")),
            ("shared".to_string(), json!("from variables")),
        ]))
        .with_input(HashMap::from([("shared".to_string(), json!("from input"))]));
    ctx.set_node_output("fetch", json!({"body": {"items": [{"id": 1}, {"id": 2}]}, "status": 200}));
    ctx
}

#[test]
fn test_template_substitutes_variables_and_node_outputs() {
    let ctx = create_test_context();

    assert_eq!(
        resolve_template("Weather in {{city}}: {{ fetch.status }}", &ctx, None),
        "Weather in Lisbon: 200"
    );
    assert_eq!(resolve_template("first={{fetch.body.items[0].id}}", &ctx, None), "first=1");
    assert_eq!(resolve_template("user {{user_id}}", &ctx, None), "user user-9");
}

#[test]
fn test_template_later_sources_override_earlier() {
    let ctx = create_test_context();
    assert_eq!(resolve_template("{{shared}}", &ctx, None), "from input");

    let extras = HashMap::from([("shared".to_string(), json!("from extras"))]);
    assert_eq!(resolve_template("{{shared}}", &ctx, Some(&extras)), "from extras");
}

#[test]
fn test_template_keeps_unknown_placeholders() {
    let ctx = create_test_context();
    assert_eq!(resolve_template("Hello {{nobody}}!", &ctx, None), "Hello {{nobody}}!");
    assert_eq!(resolve_template("no placeholders", &ctx, None), "no placeholders");
}

#[test]
fn test_template_renders_structured_values_as_json() {
    let ctx = create_test_context();
    let scope = template_scope(&ctx, None);
    assert_eq!(render("{{fetch.body.items[1]}}", &scope), r#"{"id":2}"#);
}

#[test]
fn test_resolve_value_keeps_type_of_whole_placeholder() {
    let ctx = create_test_context();
    let scope = template_scope(&ctx, None);

    let resolved = resolve_value(
        &json!({
            "status": "{{fetch.status}}",
            "label": "status={{fetch.status}}",
            "ids": ["{{fetch.body.items[0].id}}", 3],
        }),
        &scope,
    );

    assert_eq!(resolved, json!({"status": 200, "label": "status=200", "ids": [1, 3]}));
}

#[test]
fn test_paths_parse_and_select() {
    assert_eq!(
        parse_path("$.rows[*].name"),
        vec![
            PathSegment::Key("rows".to_string()),
            PathSegment::Wildcard,
            PathSegment::Key("name".to_string()),
        ]
    );

    let data = json!({"rows": [{"name": "a"}, {"name": "b"}, {"other": 1}], "map": {"0": "zero"}});
    assert_eq!(select_path(&data, "rows[*].name"), vec![json!("a"), json!("b")]);
    assert_eq!(get_path(&data, "rows.1.name"), Some(&json!("b")));
    assert_eq!(get_path(&data, "map.0"), Some(&json!("zero")));
    assert_eq!(get_path(&data, "rows[7]"), None);
}

#[test]
fn test_loose_comparisons() {
    assert!(loose_eq(&json!(42), &json!("42")));
    assert!(loose_eq(&json!(true), &json!("TRUE")));
    assert!(!loose_eq(&json!(1), &json!("one")));

    assert_eq!(compare_values(&json!("10"), &json!("9")), Some(Ordering::Greater));
    assert_eq!(compare_values(&json!("apple"), &json!("banana")), Some(Ordering::Less));
    assert_eq!(compare_values(&json!({}), &json!(1)), None);
}
