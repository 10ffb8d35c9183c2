use std::sync::Arc;

use asupersync::runtime::RuntimeBuilder;

use relmap::prelude::*;
use relmap::{BuildOptions, HookError};

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn unwrap_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

fn registry() -> Arc<Registry> {
    let registry = Registry::builder()
        .define(
            "Account",
            vec![
                AttributeDef::new("email", DataType::Text).not_null().unique(),
                AttributeDef::new("balance", DataType::Integer).default_value(0),
                AttributeDef::new("plan", DataType::Text).default_value("free"),
            ],
            SchemaOptions::new().versioned().paranoid(true),
        )
        .and_then(|b| b.build())
        .expect("registry");
    Arc::new(registry)
}

fn coordinator() -> PersistenceCoordinator<MemoryStorage> {
    let registry = registry();
    let validator = RuleValidator::new()
        .rule("Account", "email", FieldRule::Pattern("^[^@]+@[^@]+$".to_string()))
        .rule("Account", "balance", FieldRule::Range { min: Some(0.0), max: None });
    PersistenceCoordinator::with_validator(Arc::clone(&registry), MemoryStorage::new(registry), validator)
}

#[test]
fn change_tracking_follows_the_last_snapshot() {
    let registry = registry();
    let schema = registry.schema("Account").expect("schema");
    let mut account = Record::build(schema, [("email", "a@x.io")], BuildOptions::default()).expect("build");
    assert!(account.is_new());
    assert!(account.is_changed("email"));
    assert_eq!(account.get("plan"), Value::from("free"));
    assert!(!account.is_changed("plan"));

    account.commit_all();
    assert!(!account.has_changes());

    account.set("email", "a@x.io").expect("set");
    assert!(account.changed().is_empty());

    account.set("email", "b@x.io").expect("set");
    assert_eq!(account.changed(), vec!["email".to_string()]);
    assert_eq!(account.previous("email"), Some(&Value::from("a@x.io")));

    account.set("email", "a@x.io").expect("set");
    assert!(account.changed().is_empty());

    account
        .set_with("plan", Value::from("pro"), SetOptions::RAW)
        .expect("raw set");
    assert!(!account.is_changed("plan"));
    assert_eq!(account.previous("plan"), Some(&Value::from("pro")));

    account.set("nickname", "ace").expect("unknown attributes are ignored");
    assert_eq!(account.get("nickname"), Value::Null);
}

#[test]
fn saving_twice_writes_once() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let coordinator = coordinator();
        let mut account = coordinator.build("Account", [("email", "a@x.io")]).expect("build");
        unwrap_outcome(coordinator.save(&cx, &mut account, &SaveOptions::new()).await);
        unwrap_outcome(coordinator.save(&cx, &mut account, &SaveOptions::new()).await);
        assert_eq!(coordinator.storage().writes(), 1);
        assert_eq!(account.get("version").as_i64(), Some(0));

        unwrap_outcome(
            coordinator
                .update(&cx, &mut account, [("plan", "pro")], &SaveOptions::new())
                .await,
        );
        assert_eq!(coordinator.storage().writes(), 2);
        assert_eq!(account.get("version").as_i64(), Some(1));
    });
}

#[test]
fn stale_copy_fails_with_optimistic_lock() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let coordinator = coordinator();
        let account = unwrap_outcome(
            coordinator
                .create(&cx, "Account", [("email", "a@x.io")], &SaveOptions::new())
                .await,
        );
        let view = coordinator.view("Account").expect("view");
        let id = account.get("id");
        let mut first = unwrap_outcome(
            coordinator
                .find_by_pk(&cx, &view, id.clone(), FindOptions::new())
                .await,
        )
        .expect("first copy");
        let mut second = unwrap_outcome(coordinator.find_by_pk(&cx, &view, id, FindOptions::new()).await)
            .expect("second copy");

        unwrap_outcome(
            coordinator
                .update(&cx, &mut first, [("balance", 10_i64)], &SaveOptions::new())
                .await,
        );
        let err = unwrap_err(
            coordinator
                .update(&cx, &mut second, [("balance", 20_i64)], &SaveOptions::new())
                .await,
        );
        let Error::OptimisticLock(lock) = err else {
            panic!("expected an optimistic lock error, got {err:?}");
        };
        assert_eq!(lock.entity, "Account");
        assert!(second.is_changed("balance"));

        unwrap_outcome(coordinator.reload(&cx, &mut second).await);
        assert_eq!(second.get("balance").as_i64(), Some(10));
        assert!(!second.has_changes());
        unwrap_outcome(
            coordinator
                .update(&cx, &mut second, [("balance", 20_i64)], &SaveOptions::new())
                .await,
        );
        assert_eq!(second.get("version").as_i64(), Some(2));
    });
}

#[test]
fn reload_round_trips_persisted_values() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let coordinator = coordinator();
        let mut account = unwrap_outcome(
            coordinator
                .create(&cx, "Account", [("email", "a@x.io")], &SaveOptions::new())
                .await,
        );
        let saved = account.data_values();
        account.set("plan", "pro").expect("set");
        unwrap_outcome(coordinator.reload(&cx, &mut account).await);
        for (field, value) in &saved {
            assert_eq!(&account.get(field), value, "{field}");
        }
        assert_eq!(account.get("plan"), Value::from("free"));
        assert!(!account.has_changes());
        assert!(!account.is_new());
    });
}

#[test]
fn soft_deleted_records_leave_default_finds() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let coordinator = coordinator();
        let mut account = unwrap_outcome(
            coordinator
                .create(&cx, "Account", [("email", "a@x.io")], &SaveOptions::new())
                .await,
        );
        let view = coordinator.view("Account").expect("view");
        let id = account.get("id");

        unwrap_outcome(coordinator.destroy(&cx, &mut account, &DestroyOptions::new()).await);
        assert!(account.is_soft_deleted());
        let hidden = unwrap_outcome(coordinator.find_by_pk(&cx, &view, id.clone(), FindOptions::new()).await);
        assert!(hidden.is_none());
        let found = unwrap_outcome(
            coordinator
                .find_by_pk(&cx, &view, id.clone(), FindOptions::new().paranoid(false))
                .await,
        )
        .expect("still stored");
        assert!(found.is_soft_deleted());

        unwrap_outcome(coordinator.restore(&cx, &mut account, &DestroyOptions::new()).await);
        assert!(!account.is_soft_deleted());
        let back = unwrap_outcome(coordinator.find_by_pk(&cx, &view, id.clone(), FindOptions::new()).await);
        assert!(back.is_some());

        unwrap_outcome(
            coordinator
                .destroy(&cx, &mut account, &DestroyOptions::new().force(true))
                .await,
        );
        let gone = unwrap_outcome(
            coordinator
                .find_by_pk(&cx, &view, id, FindOptions::new().paranoid(false))
                .await,
        );
        assert!(gone.is_none());
    });
}

#[test]
fn find_or_create_returns_existing_rows() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let coordinator = coordinator();
        let view = coordinator.view("Account").expect("view");
        let defaults = vec![("plan".to_string(), Value::from("pro"))];

        let (created, was_created) = unwrap_outcome(
            coordinator
                .find_or_create(&cx, &view, Where::eq("email", "a@x.io"), defaults.clone())
                .await,
        );
        assert!(was_created);
        assert_eq!(created.get("plan"), Value::from("pro"));

        let (found, was_created) = unwrap_outcome(
            coordinator
                .find_or_create(&cx, &view, Where::eq("email", "a@x.io"), defaults)
                .await,
        );
        assert!(!was_created);
        assert_eq!(found.get("id"), created.get("id"));
        assert_eq!(unwrap_outcome(coordinator.count(&cx, &view, FindOptions::new()).await), 1);
    });
}

#[test]
fn hooks_see_and_shape_the_write() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut coordinator = coordinator();
        coordinator
            .hooks_mut()
            .add("Account", HookPoint::BeforeSave, |args| {
                if let Some(record) = args.record() {
                    if let Some(email) = record.get("email").as_str().map(str::to_lowercase) {
                        record.set("email", email)?;
                    }
                }
                Ok(())
            });
        coordinator
            .hooks_mut()
            .add("Account", HookPoint::BeforeDestroy, |args| {
                let frozen = args
                    .record()
                    .is_some_and(|r| r.get("plan") == Value::from("frozen"));
                if frozen {
                    return Err(Error::Hook(HookError {
                        hook: "beforeDestroy".to_string(),
                        message: "frozen accounts cannot be removed".to_string(),
                    }));
                }
                Ok(())
            });

        let mut account = unwrap_outcome(
            coordinator
                .create(&cx, "Account", [("email", "A@X.IO")], &SaveOptions::new())
                .await,
        );
        assert_eq!(account.get("email"), Value::from("a@x.io"));

        unwrap_outcome(
            coordinator
                .update(&cx, &mut account, [("plan", "frozen")], &SaveOptions::new())
                .await,
        );
        let err = unwrap_err(coordinator.destroy(&cx, &mut account, &DestroyOptions::new()).await);
        assert!(matches!(err, Error::Hook(_)));
        assert!(!account.is_soft_deleted());
    });
}

#[test]
fn validation_blocks_single_and_bulk_writes() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let coordinator = coordinator();
        let err = unwrap_err(
            coordinator
                .create(&cx, "Account", [("email", "not-an-email")], &SaveOptions::new())
                .await,
        );
        assert!(matches!(err, Error::Validation(_)));

        let rows = vec![
            vec![("email".to_string(), Value::from("a@x.io"))],
            vec![
                ("email".to_string(), Value::from("b@x.io")),
                ("balance".to_string(), Value::from(-5_i64)),
            ],
            vec![("email".to_string(), Value::from("c@x.io"))],
        ];
        let err = unwrap_err(
            coordinator
                .bulk_create(&cx, "Account", rows.clone(), &BulkOptions::new())
                .await,
        );
        let Error::BulkValidation(bulk) = err else {
            panic!("expected a bulk validation error, got {err:?}");
        };
        let failed: Vec<usize> = bulk.errors.iter().map(|e| e.index).collect();
        assert_eq!(failed, vec![1]);
        assert_eq!(coordinator.storage().writes(), 0);

        let created = unwrap_outcome(
            coordinator
                .bulk_create(&cx, "Account", rows, &BulkOptions::new().validate(false))
                .await,
        );
        assert_eq!(created.len(), 3);
        assert!(created.iter().all(|r| !r.is_new()));
    });
}

#[test]
fn increments_apply_in_storage_and_memory() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let coordinator = coordinator();
        let mut account = unwrap_outcome(
            coordinator
                .create(&cx, "Account", [("email", "a@x.io")], &SaveOptions::new())
                .await,
        );
        unwrap_outcome(coordinator.increment(&cx, &mut account, &[("balance", 7)]).await);
        unwrap_outcome(coordinator.decrement(&cx, &mut account, &[("balance", 2)]).await);
        assert_eq!(account.get("balance").as_i64(), Some(5));
        assert_eq!(account.get("version").as_i64(), Some(2));

        let view = coordinator.view("Account").expect("view");
        let stored = unwrap_outcome(
            coordinator
                .find_by_pk(&cx, &view, account.get("id"), FindOptions::new())
                .await,
        )
        .expect("stored");
        assert_eq!(stored.get("balance").as_i64(), Some(5));
    });
}
