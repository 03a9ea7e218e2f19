use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use std::sync::Arc;

use liverow::{Conditions, Error, Orm, Property, PropertyType, Schema, Value};
use liverow_memory::MemoryDriver;

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn person_schema() -> Schema {
    Schema::new("person")
        .property("name", PropertyType::Text)
        .property("age", PropertyType::Integer)
}

#[test]
fn create_then_get_round_trips_typed_values() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm.define(person_schema()).expect("define person");

        let jane = unwrap_outcome(
            person
                .create(
                    &cx,
                    vec![
                        ("name".to_string(), "Jane".into()),
                        ("age".to_string(), 32i64.into()),
                    ],
                )
                .await,
        );

        // The synthetic serial key is generated and applied.
        assert_eq!(jane.get("id"), Some(Value::Integer(1)));
        assert!(jane.is_persisted());
        assert!(jane.saved());

        orm.clear_cache();
        let fetched = unwrap_outcome(person.get(&cx, vec![Value::Integer(1)]).await);
        assert_eq!(fetched.get("name"), Some(Value::Text("Jane".to_string())));
        assert_eq!(fetched.get("age"), Some(Value::Integer(32)));
    });
}

#[test]
fn get_with_wrong_key_arity_is_a_param_mismatch() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm.define(person_schema()).expect("define person");

        match person.get(&cx, vec![]).await {
            Outcome::Err(Error::ParamMismatch(msg)) => {
                assert!(msg.contains("key properties"), "unexpected message: {msg}");
            }
            other => panic!("expected param mismatch, got {other:?}"),
        }
    });
}

#[test]
fn get_missing_row_is_not_found() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm.define(person_schema()).expect("define person");

        match person.get(&cx, vec![Value::Integer(999)]).await {
            Outcome::Err(Error::NotFound(_)) => {}
            other => panic!("expected not found, got {other:?}"),
        }
    });
}

#[test]
fn duplicate_table_definition_is_rejected() {
    let orm = Orm::new(Arc::new(MemoryDriver::new()));
    orm.define(person_schema()).expect("define person");
    match orm.define(person_schema()) {
        Err(Error::BadModel(msg)) => assert!(msg.contains("already defined")),
        other => panic!("expected bad model, got {other:?}"),
    }
}

#[test]
fn create_many_attributes_the_failing_index() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm
            .define(
                Schema::new("person")
                    .property("name", Property::new("name", PropertyType::Text).with_required(true)),
            )
            .expect("define person");

        let result = person
            .create_many(
                &cx,
                vec![
                    vec![("name".to_string(), "Jane".into())],
                    vec![],
                    vec![("name".to_string(), "John".into())],
                ],
            )
            .await;
        match result {
            Outcome::Err(Error::Custom(msg)) => {
                assert!(msg.contains("index 1"), "unexpected message: {msg}");
            }
            other => panic!("expected indexed failure, got {other:?}"),
        }

        // The item before the failure stayed saved.
        let count = unwrap_outcome(person.count(&cx, Conditions::new()).await);
        assert_eq!(count, 1);
    });
}

#[test]
fn clear_empties_the_table() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm.define(person_schema()).expect("define person");

        for name in ["Jane", "John"] {
            unwrap_outcome(
                person
                    .create(&cx, vec![("name".to_string(), name.into())])
                    .await,
            );
        }
        assert_eq!(unwrap_outcome(person.count(&cx, Conditions::new()).await), 2);

        unwrap_outcome(person.clear(&cx).await);
        assert_eq!(unwrap_outcome(person.count(&cx, Conditions::new()).await), 0);
        assert!(!unwrap_outcome(person.exists(&cx, Conditions::new()).await));
    });
}

#[test]
fn create_with_explicit_keys_inserts_rows() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let driver = Arc::new(MemoryDriver::new());
        let orm = Orm::new(driver.clone());
        let person = orm
            .define(
                Schema::new("person")
                    .property("id", Property::new("id", PropertyType::Integer).with_key(true))
                    .property("name", PropertyType::Text),
            )
            .expect("define person");

        for (id, name) in [(1i64, "Jeremy Doe"), (2, "John Doe"), (3, "Jane Doe")] {
            let created = unwrap_outcome(
                person
                    .create(
                        &cx,
                        vec![
                            ("id".to_string(), id.into()),
                            ("name".to_string(), name.into()),
                        ],
                    )
                    .await,
            );
            assert!(created.is_persisted());
            assert!(!created.is_shell());
        }
        assert_eq!(driver.row_count("person"), 3);
        assert_eq!(driver.write_counts().inserts, 3);
        assert_eq!(driver.write_counts().updates, 0);

        orm.clear_cache();
        let john = unwrap_outcome(person.get(&cx, vec![Value::Integer(2)]).await);
        assert_eq!(john.get("name"), Some(Value::Text("John Doe".to_string())));

        let does = unwrap_outcome(
            person
                .find(Conditions::new().compare(
                    "id",
                    liverow::Comparator::Gte,
                    2i64,
                ))
                .order("id")
                .run(&cx)
                .await,
        );
        assert_eq!(does.len(), 2);
    });
}

#[test]
fn explicit_serial_key_values_still_insert() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let driver = Arc::new(MemoryDriver::new());
        let orm = Orm::new(driver.clone());
        let person = orm.define(person_schema()).expect("define person");

        let seeded = unwrap_outcome(
            person
                .create(
                    &cx,
                    vec![
                        ("id".to_string(), 7i64.into()),
                        ("name".to_string(), "Jane".into()),
                    ],
                )
                .await,
        );
        assert_eq!(seeded.get("id"), Some(Value::Integer(7)));
        assert_eq!(driver.row_count("person"), 1);

        // The serial counter continues past the seeded value.
        let next = unwrap_outcome(
            person
                .create(&cx, vec![("name".to_string(), "John".into())])
                .await,
        );
        assert_eq!(next.get("id"), Some(Value::Integer(8)));
        assert_eq!(driver.row_count("person"), 2);
    });
}

#[test]
fn shell_instances_update_without_fetching() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm.define(person_schema()).expect("define person");

        unwrap_outcome(
            person
                .create(
                    &cx,
                    vec![
                        ("name".to_string(), "Jane".into()),
                        ("age".to_string(), 32i64.into()),
                    ],
                )
                .await,
        );

        let shell = person.shell(vec![Value::Integer(1)]).expect("build shell");
        assert!(shell.is_shell());
        shell.assign("age", 33i64).expect("assign age");
        unwrap_outcome(shell.save(&cx).await);

        orm.clear_cache();
        let fetched = unwrap_outcome(person.get(&cx, vec![Value::Integer(1)]).await);
        assert_eq!(fetched.get("age"), Some(Value::Integer(33)));
        assert_eq!(fetched.get("name"), Some(Value::Text("Jane".to_string())));
    });
}
