use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use liverow::{
    BeforeKind, Error, InstanceEvent, Orm, Property, PropertyType, Rule, Schema, Validation, Value,
};
use liverow_memory::MemoryDriver;
use regex::Regex;

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
fn saves_touch_the_store_only_when_dirty() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let driver = Arc::new(MemoryDriver::new());
        let orm = Orm::new(driver.clone());
        let person = orm.define(person_schema()).expect("define person");

        let jane = unwrap_outcome(
            person
                .create(&cx, vec![("name".to_string(), "Jane".into())])
                .await,
        );
        assert!(jane.saved());
        assert!(jane.dirty_properties().is_empty());

        // Saving a clean instance performs no update.
        unwrap_outcome(jane.save(&cx).await);
        assert_eq!(driver.write_counts().updates, 0);

        jane.assign("age", 32i64).expect("assign age");
        assert!(jane.is_dirty("age"));
        assert!(!jane.saved());

        unwrap_outcome(jane.save(&cx).await);
        assert_eq!(driver.write_counts().updates, 1);
        assert!(jane.saved());

        // Assigning the current value back is a no-op.
        jane.assign("age", 32i64).expect("assign age");
        assert!(!jane.is_dirty("age"));
    });
}

#[test]
fn required_validation_blocks_and_then_allows_the_save() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm
            .define(
                Schema::new("person")
                    .property("name", Property::new("name", PropertyType::Text).with_required(true))
                    .property("age", PropertyType::Integer),
            )
            .expect("define person");

        let jane = person.build(vec![("age".to_string(), 32i64.into())]).expect("build");
        match jane.save(&cx).await {
            Outcome::Err(err) => {
                let failures = err.validation_failures().expect("validation failures");
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].property, "name");
                assert_eq!(failures[0].rule, "required");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(!jane.is_persisted());

        jane.assign("name", "Jane").expect("assign name");
        unwrap_outcome(jane.save(&cx).await);
        assert!(jane.is_persisted());
    });
}

#[test]
fn null_values_skip_rules_other_than_required() {
    let orm = Orm::new(Arc::new(MemoryDriver::new()));
    let person = orm
        .define(
            person_schema().validation(Validation::new(
                "name",
                Rule::Pattern(Regex::new("^[A-Z]").expect("compile pattern")),
            )),
        )
        .expect("define person");

    // Null never reaches the pattern rule.
    let blank = person.build(vec![]).expect("build");
    assert!(blank.validate().is_empty());

    blank.assign("name", "jane").expect("assign name");
    let failures = blank.validate();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].rule, "pattern");
}

#[test]
fn return_all_errors_collects_every_failure() {
    let orm = Orm::new(Arc::new(MemoryDriver::new()));
    let person = orm
        .define(
            Schema::new("person")
                .property("name", Property::new("name", PropertyType::Text).with_required(true))
                .property("age", Property::new("age", PropertyType::Integer).with_required(true))
                .return_all_errors(true),
        )
        .expect("define person");

    let blank = person.build(vec![]).expect("build");
    let failures = blank.validate();
    assert_eq!(failures.len(), 2);
}

#[test]
fn before_hooks_can_reject_and_after_hooks_observe_the_outcome() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm.define(person_schema()).expect("define person");

        person.before(
            BeforeKind::Save,
            Arc::new(|instance| {
                if instance.get("name") == Some(Value::Text("blocked".to_string())) {
                    Err(Error::Custom("name is blocked".to_string()))
                } else {
                    Ok(())
                }
            }),
        );

        let saves = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));

        let blocked = person
            .build(vec![("name".to_string(), "blocked".into())])
            .expect("build");
        {
            let saves = saves.clone();
            let failures = failures.clone();
            blocked.on(
                InstanceEvent::Save,
                Arc::new(move |_, err| {
                    if err.is_some() {
                        failures.fetch_add(1, Ordering::SeqCst);
                    } else {
                        saves.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            );
        }

        match blocked.save(&cx).await {
            Outcome::Err(Error::Custom(msg)) => assert!(msg.contains("blocked")),
            other => panic!("expected hook rejection, got {other:?}"),
        }
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(saves.load(Ordering::SeqCst), 0);

        blocked.assign("name", "Jane").expect("assign name");
        unwrap_outcome(blocked.save(&cx).await);
        assert_eq!(saves.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn removed_instances_refuse_to_save_again() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm.define(person_schema()).expect("define person");

        let jane = unwrap_outcome(
            person
                .create(&cx, vec![("name".to_string(), "Jane".into())])
                .await,
        );
        unwrap_outcome(jane.remove(&cx).await);

        // A second remove is a no-op.
        unwrap_outcome(jane.remove(&cx).await);

        match jane.save(&cx).await {
            Outcome::Err(Error::NotDefined(_)) => {}
            other => panic!("expected refusal, got {other:?}"),
        }
    });
}

#[test]
fn serial_keys_are_immutable_once_persisted() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm.define(person_schema()).expect("define person");

        let jane = unwrap_outcome(
            person
                .create(&cx, vec![("name".to_string(), "Jane".into())])
                .await,
        );
        match jane.assign("id", 42i64) {
            Err(Error::ParamMismatch(_)) => {}
            other => panic!("expected refusal, got {other:?}"),
        }
    });
}

#[test]
fn lazy_properties_load_and_save_on_demand() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm
            .define(
                person_schema().property(
                    "biography",
                    Property::new("biography", PropertyType::Text).with_lazyload(true),
                ),
            )
            .expect("define person");

        unwrap_outcome(
            person
                .create(
                    &cx,
                    vec![
                        ("name".to_string(), "Jane".into()),
                        ("biography".to_string(), "a long story".into()),
                    ],
                )
                .await,
        );

        orm.clear_cache();
        let jane = unwrap_outcome(person.get(&cx, vec![Value::Integer(1)]).await);
        // Lazy fields are not part of the default selection.
        assert_eq!(jane.get("biography"), None);

        let loaded = unwrap_outcome(jane.load_property(&cx, "biography").await);
        assert_eq!(loaded, Value::Text("a long story".to_string()));

        unwrap_outcome(
            jane.save_property(&cx, "biography", "a short story")
                .await,
        );
        let reloaded = unwrap_outcome(jane.load_property(&cx, "biography").await);
        assert_eq!(reloaded, Value::Text("a short story".to_string()));
    });
}

#[test]
fn save_values_assigns_and_persists_in_one_call() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm.define(person_schema()).expect("define person");

        let jane = unwrap_outcome(
            person
                .create(&cx, vec![("name".to_string(), "Jane".into())])
                .await,
        );
        unwrap_outcome(
            jane.save_values(
                &cx,
                vec![
                    ("name".to_string(), "Janet".into()),
                    ("age".to_string(), 33i64.into()),
                ],
            )
            .await,
        );
        assert!(jane.saved());

        orm.clear_cache();
        let fetched = unwrap_outcome(person.get(&cx, vec![Value::Integer(1)]).await);
        assert_eq!(fetched.get("name"), Some(Value::Text("Janet".to_string())));
        assert_eq!(fetched.get("age"), Some(Value::Integer(33)));
    });
}

#[test]
fn property_defaults_apply_on_build() {
    let orm = Orm::new(Arc::new(MemoryDriver::new()));
    let person = orm
        .define(
            person_schema().property(
                "status",
                Property::new("status", PropertyType::Text).with_default("active".into()),
            ),
        )
        .expect("define person");

    let jane = person
        .build(vec![("name".to_string(), "Jane".into())])
        .expect("build");
    assert_eq!(jane.get("status"), Some(Value::Text("active".to_string())));

    let explicit = person
        .build(vec![("status".to_string(), "retired".into())])
        .expect("build");
    assert_eq!(
        explicit.get("status"),
        Some(Value::Text("retired".to_string()))
    );
}
