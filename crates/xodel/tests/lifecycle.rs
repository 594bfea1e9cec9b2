use std::cell::RefCell;
use std::sync::Arc;

use serde_json::{Map, Value, json};

use xodel::{Error, Field, Model, ModelOps, ModelSpec, Queryer, Result, Row};

/// Scripted query collaborator: records every statement and replays canned
/// responses in order. Once the script runs out it answers with no rows.
struct ScriptedQueryer {
    statements: RefCell<Vec<String>>,
    responses: RefCell<Vec<Vec<Row>>>,
}

impl ScriptedQueryer {
    fn new(responses: Vec<Vec<Row>>) -> Arc<Self> {
        Arc::new(Self {
            statements: RefCell::new(Vec::new()),
            responses: RefCell::new(responses),
        })
    }

    fn statement(&self, index: usize) -> String {
        self.statements.borrow()[index].clone()
    }
}

impl Queryer for ScriptedQueryer {
    fn execute(&self, statement: &str, _compact: bool) -> Result<Vec<Row>> {
        self.statements.borrow_mut().push(statement.to_string());
        let mut responses = self.responses.borrow_mut();
        if responses.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(responses.remove(0))
        }
    }
}

fn keyed(value: Value) -> Row {
    Row::Keyed(value.as_object().cloned().unwrap())
}

fn kwargs(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

fn author_model() -> Arc<Model> {
    ModelSpec::new("author")
        .field(Field::string("name").required().unique())
        .field(Field::email("email"))
        .field(Field::integer("age").min(0.0).max(120.0))
        .materialize()
        .unwrap()
}

fn blog_model() -> Arc<Model> {
    ModelSpec::new("blog")
        .field(Field::string("title").required())
        .field(Field::foreign_key("author", author_model()).unwrap())
        .materialize()
        .unwrap()
}

fn detail_model() -> Arc<Model> {
    ModelSpec::new("entry_detail")
        .field(Field::foreign_key_self("entry_id", "id"))
        .field(Field::string("label").required().unique())
        .materialize()
        .unwrap()
}

fn entry_model() -> Arc<Model> {
    ModelSpec::new("entry")
        .field(Field::string("name").required())
        .field(
            Field::table("details", detail_model())
                .max_rows(5)
                .cascade_column("entry_id"),
        )
        .materialize()
        .unwrap()
}

// ---- validation surfaces the failing field ----

#[test]
fn create_rejects_invalid_email_naming_the_field() {
    let ops = ModelOps::new(author_model(), ScriptedQueryer::new(vec![]));
    let err = ops
        .create(&kwargs(json!({"name": "tom", "email": "not-an-address"})))
        .unwrap_err();
    let failure = err.validation().expect("validation failure");
    assert_eq!(failure.name, "email");
}

#[test]
fn create_rejects_out_of_range_age() {
    let ops = ModelOps::new(author_model(), ScriptedQueryer::new(vec![]));
    let err = ops
        .create(&kwargs(json!({"name": "tom", "age": 300})))
        .unwrap_err();
    let failure = err.validation().expect("validation failure");
    assert_eq!(failure.name, "age");
}

// ---- save lifecycle ----

#[test]
fn create_inserts_and_merges_generated_columns() {
    let queryer = ScriptedQueryer::new(vec![vec![keyed(json!({"id": 9}))]]);
    let ops = ModelOps::new(author_model(), queryer.clone());
    let record = ops
        .create(&kwargs(json!({"name": "tom", "age": 5})))
        .unwrap();
    assert_eq!(
        queryer.statement(0),
        "INSERT INTO author (name, age) VALUES ('tom', 5) RETURNING *"
    );
    assert_eq!(record.key(), Some(&json!(9)));
    assert_eq!(record.get("name"), Some(&json!("tom")));
}

#[test]
fn save_update_fails_not_found_when_no_row_matches() {
    let ops = ModelOps::new(author_model(), ScriptedQueryer::new(vec![vec![]]));
    let err = ops
        .save_update(&kwargs(json!({"id": 1, "name": "x"})), None, None)
        .unwrap_err();
    match err {
        Error::NotFound(message) => assert_eq!(
            message,
            "update failed, record does not exist (model: author, key: id, value: 1)"
        ),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn save_update_fails_integrity_when_many_rows_match() {
    let queryer = ScriptedQueryer::new(vec![vec![
        keyed(json!({"id": 1})),
        keyed(json!({"id": 1})),
    ]]);
    let ops = ModelOps::new(author_model(), queryer);
    let err = ops
        .save_update(&kwargs(json!({"id": 1, "name": "x"})), None, None)
        .unwrap_err();
    match err {
        Error::Integrity(message) => assert_eq!(
            message,
            "expected 1 but 2 records were updated (model: author, key: id, value: 1)"
        ),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn save_update_renders_update_by_key() {
    let queryer = ScriptedQueryer::new(vec![vec![keyed(json!({"id": 1}))]]);
    let ops = ModelOps::new(author_model(), queryer.clone());
    let record = ops
        .save_update(&kwargs(json!({"id": 1, "name": "x"})), None, None)
        .unwrap();
    assert_eq!(
        queryer.statement(0),
        "UPDATE author SET name = 'x' WHERE author.id = 1 RETURNING author.id"
    );
    assert_eq!(record.key(), Some(&json!(1)));
}

#[test]
fn save_dispatches_between_create_and_update() {
    let queryer = ScriptedQueryer::new(vec![
        vec![keyed(json!({"id": 1}))],
        vec![keyed(json!({"id": 1}))],
    ]);
    let ops = ModelOps::new(author_model(), queryer.clone());
    ops.save(&kwargs(json!({"name": "a"})), None).unwrap();
    assert!(queryer.statement(0).starts_with("INSERT INTO author"));
    ops.save(&kwargs(json!({"id": 1, "name": "a"})), None)
        .unwrap();
    assert!(queryer.statement(1).starts_with("UPDATE author SET"));
}

#[test]
fn save_by_unique_key_requires_unique_field() {
    let ops = ModelOps::new(author_model(), ScriptedQueryer::new(vec![]));
    let err = ops
        .save_update(&kwargs(json!({"age": 3})), None, Some("age"))
        .unwrap_err();
    assert!(matches!(err, Error::Construction(_)));
}

// ---- cascade save ----

#[test]
fn cascade_update_aligns_nested_rows_before_the_parent_update() {
    let queryer = ScriptedQueryer::new(vec![vec![keyed(json!({"id": 1}))]]);
    let ops = ModelOps::new(entry_model(), queryer.clone());
    ops.save_cascade_update(
        &kwargs(json!({
            "id": 1,
            "name": "x",
            "details": [{"label": "a"}, {"label": "b"}],
        })),
        None,
    )
    .unwrap();
    assert_eq!(
        queryer.statement(0),
        "WITH U AS (INSERT INTO entry_detail (label, entry_id) \
         VALUES ('a'::varchar(256), 1::integer), ('b', 1) \
         ON CONFLICT (label) DO UPDATE SET entry_id = EXCLUDED.entry_id RETURNING label) \
         DELETE FROM entry_detail WHERE (entry_detail.entry_id = 1) \
         AND (entry_detail.label) NOT IN (SELECT label FROM U);\
         UPDATE entry SET name = 'x' WHERE entry.id = 1 RETURNING entry.id"
    );
}

#[test]
fn cascade_update_with_only_nested_rows_probes_instead_of_updating() {
    let queryer = ScriptedQueryer::new(vec![vec![keyed(json!({"id": 1}))]]);
    let ops = ModelOps::new(entry_model(), queryer.clone());
    ops.save_cascade_update(
        &kwargs(json!({"id": 1, "details": [{"label": "a"}]})),
        None,
    )
    .unwrap();
    assert_eq!(
        queryer.statement(0),
        "WITH U AS (INSERT INTO entry_detail (label, entry_id) \
         VALUES ('a'::varchar(256), 1::integer) \
         ON CONFLICT (label) DO UPDATE SET entry_id = EXCLUDED.entry_id RETURNING label) \
         DELETE FROM entry_detail WHERE (entry_detail.entry_id = 1) \
         AND (entry_detail.label) NOT IN (SELECT label FROM U);\
         SELECT entry.id FROM entry WHERE entry.id = 1"
    );
}

#[test]
fn cascade_update_deletes_nested_rows_when_the_batch_is_empty() {
    let queryer = ScriptedQueryer::new(vec![vec![keyed(json!({"id": 1}))]]);
    let ops = ModelOps::new(entry_model(), queryer.clone());
    ops.save_cascade_update(&kwargs(json!({"id": 1, "name": "x", "details": []})), None)
        .unwrap();
    assert_eq!(
        queryer.statement(0),
        "DELETE FROM entry_detail WHERE entry_detail.entry_id = 1;\
         UPDATE entry SET name = 'x' WHERE entry.id = 1 RETURNING entry.id"
    );
}

// ---- reads ----

#[test]
fn get_returns_not_found_and_integrity_failures() {
    let ops = ModelOps::new(author_model(), ScriptedQueryer::new(vec![vec![]]));
    assert!(matches!(
        ops.get(&kwargs(json!({"id": 1}))),
        Err(Error::NotFound(_))
    ));

    let two = ScriptedQueryer::new(vec![vec![
        keyed(json!({"id": 1})),
        keyed(json!({"id": 2})),
    ]]);
    let ops = ModelOps::new(author_model(), two);
    match ops.get(&kwargs(json!({"age": 3}))).unwrap_err() {
        Error::Integrity(message) => assert_eq!(message, "2 records returned"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn try_get_returns_none_unless_exactly_one_row() {
    let ops = ModelOps::new(author_model(), ScriptedQueryer::new(vec![vec![]]));
    assert!(ops.try_get(&kwargs(json!({"id": 1}))).unwrap().is_none());

    let one = ScriptedQueryer::new(vec![vec![keyed(json!({"id": 1, "name": "a"}))]]);
    let ops = ModelOps::new(author_model(), one);
    let record = ops.try_get(&kwargs(json!({"id": 1}))).unwrap().unwrap();
    assert_eq!(record.get("name"), Some(&json!("a")));
}

#[test]
fn filter_follows_foreign_key_paths_with_one_join() {
    let queryer = ScriptedQueryer::new(vec![vec![keyed(json!({"id": 3, "title": "t"}))]]);
    let ops = ModelOps::new(blog_model(), queryer.clone());
    let records = ops
        .filter(&kwargs(json!({"author__name__contains": "tom"})))
        .unwrap();
    assert_eq!(
        queryer.statement(0),
        "SELECT * FROM blog INNER JOIN author T1 ON (blog.author = T1.id) \
         WHERE T1.name LIKE '%tom%'"
    );
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("title"), Some(&json!("t")));
}

#[test]
fn count_and_exists_render_compact_probes() {
    let queryer = ScriptedQueryer::new(vec![
        vec![Row::Compact(vec![json!(3)])],
        vec![Row::Compact(vec![json!(true)])],
    ]);
    let ops = ModelOps::new(author_model(), queryer.clone());
    assert_eq!(ops.count(Some(&kwargs(json!({"age": 9})))).unwrap(), 3);
    assert_eq!(
        queryer.statement(0),
        "SELECT count(*) FROM author WHERE author.age = 9"
    );
    assert!(ops.exists(Some(&kwargs(json!({"name": "a"})))).unwrap());
    assert_eq!(
        queryer.statement(1),
        "SELECT EXISTS (SELECT 1 FROM author WHERE author.name = 'a' LIMIT 1)"
    );
}

// ---- get_or_create ----

#[test]
fn get_or_create_inserts_and_reports_created() {
    let queryer = ScriptedQueryer::new(vec![vec![keyed(json!({
        "id": 7, "name": "tom", "age": 3, "__is_inserted__": true,
    }))]]);
    let ops = ModelOps::new(author_model(), queryer.clone());
    let (record, created) = ops
        .get_or_create(&kwargs(json!({"name": "tom"})), Some(&kwargs(json!({"age": 3}))))
        .unwrap();
    assert!(created);
    assert_eq!(record.key(), Some(&json!(7)));
    assert!(record.get("__is_inserted__").is_none());
    assert_eq!(
        queryer.statement(0),
        "WITH new_records(id, name, age) AS \
         (INSERT INTO author(name, age) SELECT 'tom', 3 \
         WHERE NOT EXISTS (SELECT 1 FROM author WHERE author.name = 'tom') \
         RETURNING id, name, age) \
         SELECT id, name, age, TRUE AS __is_inserted__ FROM new_records \
         UNION ALL (SELECT id, name, age, FALSE AS __is_inserted__ \
         FROM author WHERE author.name = 'tom')"
    );
}

#[test]
fn get_or_create_returns_the_existing_row_uncreated() {
    let queryer = ScriptedQueryer::new(vec![vec![keyed(json!({
        "id": 7, "name": "tom", "__is_inserted__": false,
    }))]]);
    let ops = ModelOps::new(author_model(), queryer);
    let (record, created) = ops
        .get_or_create(&kwargs(json!({"name": "tom"})), None)
        .unwrap();
    assert!(!created);
    assert_eq!(record.key(), Some(&json!(7)));
}

#[test]
fn get_or_create_fails_on_multiple_matches() {
    let queryer = ScriptedQueryer::new(vec![vec![
        keyed(json!({"id": 1, "name": "tom", "__is_inserted__": false})),
        keyed(json!({"id": 2, "name": "tom", "__is_inserted__": false})),
    ]]);
    let ops = ModelOps::new(author_model(), queryer);
    let err = ops
        .get_or_create(&kwargs(json!({"name": "tom"})), None)
        .unwrap_err();
    match err {
        Error::Integrity(message) => assert_eq!(message, "multiple records returned"),
        other => panic!("unexpected error: {other}"),
    }
}

// ---- bulk writes ----

#[test]
fn upsert_defaults_the_conflict_key_to_the_unique_column() {
    let queryer = ScriptedQueryer::new(vec![vec![]]);
    let ops = ModelOps::new(author_model(), queryer.clone());
    let rows = vec![
        kwargs(json!({"name": "a", "age": 1})),
        kwargs(json!({"name": "b", "age": 2})),
    ];
    ops.upsert(&rows, None).unwrap();
    assert_eq!(
        queryer.statement(0),
        "INSERT INTO author (name, age) VALUES ('a'::varchar(256), 1::integer), ('b', 2) \
         ON CONFLICT (name) DO UPDATE SET age = EXCLUDED.age"
    );
}

#[test]
fn upsert_reports_the_row_missing_its_key() {
    let ops = ModelOps::new(author_model(), ScriptedQueryer::new(vec![]));
    let rows = vec![
        kwargs(json!({"name": "a"})),
        kwargs(json!({"age": 2})),
    ];
    let err = ops.upsert(&rows, None).unwrap_err();
    assert!(matches!(err, Error::BatchValidation { batch_index: 1, .. }));
}

#[test]
fn merge_inserts_only_the_rows_the_update_missed() {
    let queryer = ScriptedQueryer::new(vec![vec![]]);
    let ops = ModelOps::new(author_model(), queryer.clone());
    let rows = vec![
        kwargs(json!({"name": "a", "age": 1})),
        kwargs(json!({"name": "b", "age": 2})),
    ];
    ops.merge(&rows, None).unwrap();
    let statement = queryer.statement(0);
    assert!(statement.starts_with(
        "WITH V(name, age) AS (VALUES ('a'::varchar(256), 1::integer), ('b', 2))"
    ));
    assert!(statement.contains(
        "U AS (UPDATE author W SET age = V.age FROM V WHERE V.name = W.name \
         RETURNING V.name, V.age)"
    ));
    assert!(statement.ends_with(
        "INSERT INTO author (name, age) SELECT V.name, V.age FROM V \
         LEFT JOIN U AS W ON (V.name = W.name) WHERE W.name IS NULL"
    ));
}

#[test]
fn align_deletes_exactly_the_rows_absent_from_the_batch() {
    let queryer = ScriptedQueryer::new(vec![vec![]]);
    let ops = ModelOps::new(author_model(), queryer.clone());
    let rows = vec![kwargs(json!({"name": "a", "age": 1}))];
    ops.align(&rows, None, Some(&kwargs(json!({"age": 1}))))
        .unwrap();
    assert_eq!(
        queryer.statement(0),
        "WITH U AS (INSERT INTO author (name, age) VALUES ('a'::varchar(256), 1::integer) \
         ON CONFLICT (name) DO UPDATE SET age = EXCLUDED.age RETURNING name) \
         DELETE FROM author WHERE (author.age = 1) \
         AND (author.name) NOT IN (SELECT name FROM U)"
    );
}

#[test]
fn updates_joins_the_values_batch_on_the_key() {
    let queryer = ScriptedQueryer::new(vec![vec![]]);
    let ops = ModelOps::new(author_model(), queryer.clone());
    let rows = vec![
        kwargs(json!({"name": "a", "age": 10})),
        kwargs(json!({"name": "b", "age": 20})),
    ];
    ops.updates(&rows, Some(&["name".to_string()])).unwrap();
    assert_eq!(
        queryer.statement(0),
        "WITH V(name, age) AS (VALUES ('a'::varchar(256), 10::integer), ('b', 20)) \
         UPDATE author SET age = V.age FROM V WHERE V.name = author.name"
    );
}

#[test]
fn get_multiple_joins_the_key_batch_back_to_the_table() {
    let queryer = ScriptedQueryer::new(vec![vec![keyed(json!({"id": 1, "name": "a"}))]]);
    let ops = ModelOps::new(author_model(), queryer.clone());
    let keys = vec![kwargs(json!({"name": "a"})), kwargs(json!({"name": "b"}))];
    let records = ops.get_multiple(&keys, &["name".to_string()]).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        queryer.statement(0),
        "WITH V(name) AS (VALUES ('a'::varchar(256)), ('b')) \
         SELECT * FROM author RIGHT JOIN V ON (V.name = author.name)"
    );
}
