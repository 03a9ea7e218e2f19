use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use std::sync::Arc;

use liverow::{Error, OneOptions, Orm, PropertyType, Related, Schema, Value};
use liverow_memory::MemoryDriver;

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

#[test]
fn has_one_injects_foreign_key_fields() {
    let orm = Orm::new(Arc::new(MemoryDriver::new()));
    let person = orm
        .define(Schema::new("person").property("name", PropertyType::Text))
        .expect("define person");
    let pet = orm
        .define(Schema::new("pet").property("name", PropertyType::Text))
        .expect("define pet");

    pet.has_one("owner", &person, OneOptions::default())
        .expect("declare owner");

    let fk = pet.def().property("owner_id").expect("owner_id property");
    assert_eq!(fk.kind, PropertyType::Integer);
    assert!(!fk.enumerable);
}

#[test]
fn staged_references_are_flushed_by_a_cascading_save() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let driver = Arc::new(MemoryDriver::new());
        let orm = Orm::new(driver.clone());
        let person = orm
            .define(Schema::new("person").property("name", PropertyType::Text))
            .expect("define person");
        let pet = orm
            .define(Schema::new("pet").property("name", PropertyType::Text))
            .expect("define pet");
        pet.has_one("owner", &person, OneOptions::default())
            .expect("declare owner");

        let jane = person
            .build(vec![("name".to_string(), "Jane".into())])
            .expect("build jane");
        let rex = pet
            .build(vec![("name".to_string(), "Rex".into())])
            .expect("build rex");

        rex.stage_related("owner", Related::One(Some(jane.clone())));
        unwrap_outcome(rex.save(&cx).await);

        // Both rows were written and the copied key updated the pet once.
        assert!(jane.is_persisted());
        assert!(rex.is_persisted());
        assert_eq!(driver.write_counts().inserts, 2);
        assert_eq!(driver.write_counts().updates, 1);
        assert_eq!(rex.get("owner_id"), jane.get("id"));
    });
}

#[test]
fn multiple_staged_references_flush_in_staging_order() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm
            .define(Schema::new("person").property("name", PropertyType::Text))
            .expect("define person");
        let clinic = orm
            .define(Schema::new("clinic").property("name", PropertyType::Text))
            .expect("define clinic");
        let pet = orm
            .define(Schema::new("pet").property("name", PropertyType::Text))
            .expect("define pet");
        pet.has_one("owner", &person, OneOptions::default())
            .expect("declare owner");
        pet.has_one("vet", &clinic, OneOptions::default())
            .expect("declare vet");

        let jane = person
            .build(vec![("name".to_string(), "Jane".into())])
            .expect("build jane");
        let practice = clinic
            .build(vec![("name".to_string(), "Northside".into())])
            .expect("build clinic");
        let rex = pet
            .build(vec![("name".to_string(), "Rex".into())])
            .expect("build rex");

        rex.stage_related("owner", Related::One(Some(jane.clone())));
        rex.stage_related("vet", Related::One(Some(practice.clone())));
        unwrap_outcome(rex.save(&cx).await);

        assert_eq!(rex.get("owner_id"), jane.get("id"));
        assert_eq!(rex.get("vet_id"), practice.get("id"));
    });
}

#[test]
fn marking_a_cached_reference_changed_flushes_it_on_save() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm
            .define(Schema::new("person").property("name", PropertyType::Text))
            .expect("define person");
        let pet = orm
            .define(Schema::new("pet").property("name", PropertyType::Text))
            .expect("define pet");
        pet.has_one("owner", &person, OneOptions::default())
            .expect("declare owner");

        let jane = unwrap_outcome(
            person
                .create(&cx, vec![("name".to_string(), "Jane".into())])
                .await,
        );
        let rex = unwrap_outcome(
            pet.create(&cx, vec![("name".to_string(), "Rex".into())])
                .await,
        );

        rex.stage_related("owner", Related::One(Some(jane.clone())));
        rex.mark_related_changed("owner").expect("mark changed");
        unwrap_outcome(rex.save(&cx).await);
        assert_eq!(rex.get("owner_id"), jane.get("id"));

        match rex.mark_related_changed("parent") {
            Err(Error::NotDefined(_)) => {}
            other => panic!("expected unknown association, got {other:?}"),
        }
    });
}

#[test]
fn get_related_resolves_through_the_identity_cache() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm
            .define(Schema::new("person").property("name", PropertyType::Text))
            .expect("define person");
        let pet = orm
            .define(Schema::new("pet").property("name", PropertyType::Text))
            .expect("define pet");
        pet.has_one("owner", &person, OneOptions::default())
            .expect("declare owner");

        let jane = unwrap_outcome(
            person
                .create(&cx, vec![("name".to_string(), "Jane".into())])
                .await,
        );
        let rex = unwrap_outcome(
            pet.create(&cx, vec![("name".to_string(), "Rex".into())])
                .await,
        );
        unwrap_outcome(
            rex.set_related(&cx, "owner", Related::One(Some(jane.clone())))
                .await,
        );

        match unwrap_outcome(rex.get_related(&cx, "owner").await) {
            Related::One(Some(owner)) => assert!(owner.same_as(&jane)),
            other => panic!("expected owner, got {other:?}"),
        }
    });
}

#[test]
fn unset_references_resolve_to_none() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm
            .define(Schema::new("person").property("name", PropertyType::Text))
            .expect("define person");
        let pet = orm
            .define(Schema::new("pet").property("name", PropertyType::Text))
            .expect("define pet");
        pet.has_one("owner", &person, OneOptions::default())
            .expect("declare owner");

        let rex = unwrap_outcome(
            pet.create(&cx, vec![("name".to_string(), "Rex".into())])
                .await,
        );
        match unwrap_outcome(rex.get_related(&cx, "owner").await) {
            Related::One(None) => {}
            other => panic!("expected no owner, got {other:?}"),
        }
    });
}

#[test]
fn clearing_a_reference_nulls_the_foreign_keys() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm
            .define(Schema::new("person").property("name", PropertyType::Text))
            .expect("define person");
        let pet = orm
            .define(Schema::new("pet").property("name", PropertyType::Text))
            .expect("define pet");
        pet.has_one("owner", &person, OneOptions::default())
            .expect("declare owner");

        let jane = unwrap_outcome(
            person
                .create(&cx, vec![("name".to_string(), "Jane".into())])
                .await,
        );
        let rex = unwrap_outcome(
            pet.create(&cx, vec![("name".to_string(), "Rex".into())])
                .await,
        );
        unwrap_outcome(
            rex.set_related(&cx, "owner", Related::One(Some(jane)))
                .await,
        );
        unwrap_outcome(rex.remove_related(&cx, "owner", &[]).await);

        assert_eq!(rex.get("owner_id"), Some(Value::Null));
        match unwrap_outcome(rex.get_related(&cx, "owner").await) {
            Related::One(None) => {}
            other => panic!("expected cleared owner, got {other:?}"),
        }
    });
}

#[test]
fn reverse_declarations_expose_the_inverse_collection() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let orm = Orm::new(Arc::new(MemoryDriver::new()));
        let person = orm
            .define(Schema::new("person").property("name", PropertyType::Text))
            .expect("define person");
        let pet = orm
            .define(Schema::new("pet").property("name", PropertyType::Text))
            .expect("define pet");
        pet.has_one(
            "owner",
            &person,
            OneOptions {
                reverse: Some("pets".to_string()),
                ..OneOptions::default()
            },
        )
        .expect("declare owner");

        let jane = unwrap_outcome(
            person
                .create(&cx, vec![("name".to_string(), "Jane".into())])
                .await,
        );
        for name in ["Rex", "Fido"] {
            let animal = unwrap_outcome(
                pet.create(&cx, vec![("name".to_string(), name.into())])
                    .await,
            );
            unwrap_outcome(
                animal
                    .set_related(&cx, "owner", Related::One(Some(jane.clone())))
                    .await,
            );
        }

        match unwrap_outcome(jane.get_related(&cx, "pets").await) {
            Related::Many(pets) => assert_eq!(pets.len(), 2),
            other => panic!("expected collection, got {other:?}"),
        }

        let rex = unwrap_outcome(pet.get(&cx, vec![Value::Integer(1)]).await);
        assert!(unwrap_outcome(
            jane.has_related(&cx, "pets", std::slice::from_ref(&rex)).await
        ));

        // The inverse side cannot detach; the owning side holds the keys.
        match jane.remove_related(&cx, "pets", &[rex]).await {
            Outcome::Err(Error::ParamMismatch(_)) => {}
            other => panic!("expected refusal, got {other:?}"),
        }
    });
}
