use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use std::sync::Arc;

use liverow::{Error, GetOptions, Orm, PropertyType, Schema, Value};
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
fn repeated_gets_return_the_same_handle() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm.define(person_schema()).expect("define person");

        let created = unwrap_outcome(
            person
                .create(&cx, vec![("name".to_string(), "Jane".into())])
                .await,
        );

        let first = unwrap_outcome(person.get(&cx, vec![Value::Integer(1)]).await);
        let second = unwrap_outcome(person.get(&cx, vec![Value::Integer(1)]).await);
        assert!(first.same_as(&second));
        // The create registers itself too, so get returns the created handle.
        assert!(created.same_as(&first));
    });
}

#[test]
fn clearing_the_cache_yields_fresh_handles() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm.define(person_schema()).expect("define person");

        unwrap_outcome(
            person
                .create(&cx, vec![("name".to_string(), "Jane".into())])
                .await,
        );

        let first = unwrap_outcome(person.get(&cx, vec![Value::Integer(1)]).await);
        orm.clear_cache();
        let second = unwrap_outcome(person.get(&cx, vec![Value::Integer(1)]).await);
        assert!(!first.same_as(&second));
    });
}

#[test]
fn dirty_cached_entries_are_bypassed_by_the_save_check() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm.define(person_schema()).expect("define person");

        unwrap_outcome(
            person
                .create(&cx, vec![("name".to_string(), "Jane".into())])
                .await,
        );

        let first = unwrap_outcome(person.get(&cx, vec![Value::Integer(1)]).await);
        first.assign("name", "Janet").expect("assign name");
        assert!(first.has_unsaved_changes());

        // A stale entry is replaced by a freshly hydrated handle.
        let second = unwrap_outcome(person.get(&cx, vec![Value::Integer(1)]).await);
        assert!(!first.same_as(&second));
        assert_eq!(second.get("name"), Some(Value::Text("Jane".to_string())));
    });
}

#[test]
fn save_check_can_be_disabled_per_call() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm.define(person_schema()).expect("define person");

        unwrap_outcome(
            person
                .create(&cx, vec![("name".to_string(), "Jane".into())])
                .await,
        );

        let first = unwrap_outcome(person.get(&cx, vec![Value::Integer(1)]).await);
        first.assign("name", "Janet").expect("assign name");

        let options = GetOptions {
            save_check: Some(false),
            ..GetOptions::default()
        };
        let second = unwrap_outcome(
            person
                .get_with(&cx, vec![Value::Integer(1)], options)
                .await,
        );
        assert!(first.same_as(&second));
        assert_eq!(second.get("name"), Some(Value::Text("Janet".to_string())));
    });
}

#[test]
fn removing_an_instance_evicts_it() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm.define(person_schema()).expect("define person");

        unwrap_outcome(
            person
                .create(&cx, vec![("name".to_string(), "Jane".into())])
                .await,
        );
        let handle = unwrap_outcome(person.get(&cx, vec![Value::Integer(1)]).await);
        unwrap_outcome(handle.remove(&cx).await);
        assert!(handle.is_removed());

        match person.get(&cx, vec![Value::Integer(1)]).await {
            Outcome::Err(Error::NotFound(_)) => {}
            other => panic!("expected not found after remove, got {other:?}"),
        }
    });
}

#[test]
fn identity_cache_can_be_disabled_per_model() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm
            .define(person_schema().identity_cache(false))
            .expect("define person");

        unwrap_outcome(
            person
                .create(&cx, vec![("name".to_string(), "Jane".into())])
                .await,
        );
        let first = unwrap_outcome(person.get(&cx, vec![Value::Integer(1)]).await);
        let second = unwrap_outcome(person.get(&cx, vec![Value::Integer(1)]).await);
        assert!(!first.same_as(&second));
    });
}
