use std::sync::Arc;

use asupersync::runtime::RuntimeBuilder;

use relmap::prelude::*;
use relmap::{EagerLoadingErrorKind, QueryPlan};

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn registry() -> Arc<Registry> {
    let registry = Registry::builder()
        .define("League", vec![AttributeDef::new("name", DataType::Text)], SchemaOptions::new())
        .and_then(|b| {
            b.define(
                "Team",
                vec![
                    AttributeDef::new("name", DataType::Text),
                    AttributeDef::new("city", DataType::Text),
                    AttributeDef::new("league_id", DataType::Integer),
                ],
                SchemaOptions::new()
                    .scope("north", Scope::new().filter(Where::eq("city", "oslo")))
                    .scope("named_r", Scope::new().filter(Where::like("name", "r%")))
                    .scope("not_oslo", Scope::new().filter(Where::ne("city", "oslo"))),
            )
        })
        .and_then(|b| {
            b.define(
                "Player",
                vec![
                    AttributeDef::new("name", DataType::Text),
                    AttributeDef::new("team_id", DataType::Integer),
                    AttributeDef::new("active", DataType::Boolean),
                ],
                SchemaOptions::new().paranoid(true),
            )
        })
        .and_then(|b| {
            b.define(
                "Sponsor",
                vec![AttributeDef::new("label", DataType::Text)],
                SchemaOptions::new().timestamps(false),
            )
        })
        .and_then(|b| {
            b.define(
                "TeamSponsor",
                vec![
                    AttributeDef::new("team_id", DataType::Integer),
                    AttributeDef::new("sponsor_id", DataType::Integer),
                    AttributeDef::new("tier", DataType::Integer),
                ],
                SchemaOptions::new().timestamps(false),
            )
        })
        .map(|b| {
            b.associate(Association::has_many("Team", "Player", "team_id").alias("players"))
                .associate(Association::belongs_to("Team", "League", "league_id").alias("league"))
                .associate(
                    Association::belongs_to_many(
                        "Team",
                        "Sponsor",
                        Through::new("TeamSponsor", "team_id", "sponsor_id"),
                    )
                    .alias("sponsors"),
                )
                .associate(Association::belongs_to("Player", "Team", "team_id").alias("team"))
        })
        .and_then(|b| b.build())
        .expect("registry");
    Arc::new(registry)
}

fn coordinator() -> PersistenceCoordinator<MemoryStorage> {
    let registry = registry();
    PersistenceCoordinator::new(Arc::clone(&registry), MemoryStorage::new(registry))
}

/// reds (oslo): ann active, bo inactive
/// blues (oslo): cy inactive
/// rovers (bergen): dee active
async fn seed(cx: &Cx, coordinator: &PersistenceCoordinator<MemoryStorage>) {
    let save = SaveOptions::new();
    for (name, city) in [("reds", "oslo"), ("blues", "oslo"), ("rovers", "bergen")] {
        unwrap_outcome(
            coordinator
                .create(cx, "Team", [("name", name), ("city", city)], &save)
                .await,
        );
    }
    for (name, team, active) in [("ann", 1, true), ("bo", 1, false), ("cy", 2, false), ("dee", 3, true)] {
        let values = [
            ("name", Value::from(name)),
            ("team_id", Value::from(team)),
            ("active", Value::from(active)),
        ];
        unwrap_outcome(coordinator.create(cx, "Player", values, &save).await);
    }
}

fn root_aliases(plan: &QueryPlan) -> Vec<String> {
    let mut aliases: Vec<String> = plan
        .roots()
        .iter()
        .map(|id| plan.node(*id).alias.clone())
        .collect();
    aliases.sort();
    aliases
}

fn names<'a>(records: impl IntoIterator<Item = &'a Record>) -> Vec<String> {
    records
        .into_iter()
        .filter_map(|r| r.get("name").as_str().map(str::to_string))
        .collect()
}

#[test]
fn include_all_many_selects_multi_valued_associations() {
    let coordinator = coordinator();
    let view = coordinator.view("Team").expect("view");
    let all = IncludeAll::parse(&["Many"]).expect("include all");
    let plan = coordinator
        .plan_find(&view, FindOptions::new().include(all))
        .expect("plan");
    assert_eq!(root_aliases(&plan), vec!["players", "sponsors"]);

    let everything = coordinator
        .plan_find(&view, FindOptions::new().include(IncludeAll::everything()))
        .expect("plan");
    assert_eq!(root_aliases(&everything), vec!["league", "players", "sponsors"]);

    let err = IncludeAll::parse(&["Several"]).unwrap_err();
    assert!(matches!(err, Error::EagerLoading(ref e) if e.kind == EagerLoadingErrorKind::InvalidIncludeAll));
}

#[test]
fn limited_find_with_filtered_include_pages_root_rows() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let coordinator = coordinator();
        seed(&cx, &coordinator).await;
        let view = coordinator.view("Team").expect("view");
        let options = FindOptions::new()
            .limit(10)
            .order(OrderBy::asc("id"))
            .include(IncludeOptions::alias("players").filter(Where::eq("active", true)));

        let plan = coordinator.plan_find(&view, options.clone()).expect("plan");
        assert!(plan.sub_query);
        let players = plan.node(plan.roots()[0]);
        assert!(players.required);
        assert!(!players.sub_query);
        assert!(players.sub_query_filter);

        let teams = unwrap_outcome(coordinator.find_all(&cx, &view, options).await);
        assert_eq!(names(&teams), vec!["reds", "rovers"]);
        let roster = teams[0].related("players").expect("players");
        assert_eq!(roster.len(), 1);
        assert_eq!(roster.records()[0].get("name"), Value::from("ann"));

        let unlimited = coordinator
            .plan_find(&view, FindOptions::new().include(IncludeOptions::alias("players").required(true)))
            .expect("plan");
        assert!(!unlimited.sub_query);
        assert!(unlimited.nodes().iter().all(|n| !n.sub_query));
    });
}

#[test]
fn limit_counts_parents_not_joined_rows() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let coordinator = coordinator();
        seed(&cx, &coordinator).await;
        let view = coordinator.view("Team").expect("view");
        let teams = unwrap_outcome(
            coordinator
                .find_all(
                    &cx,
                    &view,
                    FindOptions::new().include("players").order(OrderBy::asc("id")).limit(2),
                )
                .await,
        );
        assert_eq!(names(&teams), vec!["reds", "blues"]);
        assert_eq!(teams[0].related("players").expect("players").len(), 2);
        assert_eq!(teams[1].related("players").expect("players").len(), 1);
    });
}

#[test]
fn soft_deleted_children_are_hidden_unless_asked_for() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let coordinator = coordinator();
        seed(&cx, &coordinator).await;
        let players = coordinator.view("Player").expect("view");
        let mut bo = unwrap_outcome(
            coordinator
                .find_one(&cx, &players, FindOptions::new().filter(Where::eq("name", "bo")))
                .await,
        )
        .expect("bo");
        unwrap_outcome(coordinator.destroy(&cx, &mut bo, &DestroyOptions::new()).await);
        assert!(bo.is_soft_deleted());

        let teams = coordinator.view("Team").expect("view");
        let reds = unwrap_outcome(
            coordinator
                .find_by_pk(&cx, &teams, 1_i64, FindOptions::new().include("players"))
                .await,
        )
        .expect("reds");
        assert_eq!(names(reds.related("players").expect("players").records()), vec!["ann"]);

        let with_deleted = unwrap_outcome(
            coordinator
                .find_by_pk(
                    &cx,
                    &teams,
                    1_i64,
                    FindOptions::new().include(IncludeOptions::alias("players").paranoid(false)),
                )
                .await,
        )
        .expect("reds");
        assert_eq!(with_deleted.related("players").expect("players").len(), 2);

        let live = unwrap_outcome(coordinator.count(&cx, &players, FindOptions::new()).await);
        let all = unwrap_outcome(coordinator.count(&cx, &players, FindOptions::new().paranoid(false)).await);
        assert_eq!((live, all), (3, 4));
    });
}

#[test]
fn many_to_many_include_carries_junction_row() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let coordinator = coordinator();
        seed(&cx, &coordinator).await;
        let save = SaveOptions::new();
        for label in ["acme", "globex"] {
            unwrap_outcome(coordinator.create(&cx, "Sponsor", [("label", label)], &save).await);
        }
        for (sponsor, tier) in [(1_i64, 1_i64), (2, 3)] {
            let values = [("team_id", 1_i64), ("sponsor_id", sponsor), ("tier", tier)];
            unwrap_outcome(coordinator.create(&cx, "TeamSponsor", values, &save).await);
        }

        let view = coordinator.view("Team").expect("view");
        let reds = unwrap_outcome(
            coordinator
                .find_by_pk(&cx, &view, 1_i64, FindOptions::new().include("sponsors"))
                .await,
        )
        .expect("reds");
        let sponsors = reds.related("sponsors").expect("sponsors").records();
        assert_eq!(sponsors.len(), 2);
        let globex = sponsors
            .iter()
            .find(|s| s.get("label") == Value::from("globex"))
            .expect("globex");
        let link = globex.related("TeamSponsor").expect("junction").records();
        assert_eq!(link[0].get("tier").as_i64(), Some(3));

        let blues = unwrap_outcome(
            coordinator
                .find_by_pk(&cx, &view, 2_i64, FindOptions::new().include("sponsors"))
                .await,
        )
        .expect("blues");
        assert!(blues.related("sponsors").expect("sponsors").is_empty());
    });
}

#[test]
fn separate_include_is_fetched_and_distributed() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let coordinator = coordinator();
        seed(&cx, &coordinator).await;
        let view = coordinator.view("Team").expect("view");
        let options = FindOptions::new()
            .order(OrderBy::asc("id"))
            .include(
                IncludeOptions::alias("players")
                    .separate(true)
                    .include("team"),
            );
        let plan = coordinator.plan_find(&view, options.clone()).expect("plan");
        assert_eq!(plan.separate_roots().len(), 1);

        let teams = unwrap_outcome(coordinator.find_all(&cx, &view, options).await);
        let sizes: Vec<usize> = teams
            .iter()
            .map(|t| t.related("players").expect("players").len())
            .collect();
        assert_eq!(sizes, vec![2, 1, 1]);

        let dee = teams[2].related("players").expect("players").records()[0].clone();
        assert!(matches!(dee.related("team"), Some(Related::One(Some(team))) if team.get("name") == Value::from("rovers")));
    });
}

#[test]
fn named_scopes_conjoin() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let coordinator = coordinator();
        seed(&cx, &coordinator).await;
        let view = coordinator.view("Team").expect("view");

        let north = view.scope(&["north"]).expect("scope");
        let both = view.scope(&["north", "named_r"]).expect("scope");
        let order = || FindOptions::new().order(OrderBy::asc("id"));

        let teams = unwrap_outcome(coordinator.find_all(&cx, &north, order()).await);
        assert_eq!(names(&teams), vec!["reds", "blues"]);
        let teams = unwrap_outcome(coordinator.find_all(&cx, &both, order()).await);
        assert_eq!(names(&teams), vec!["reds"]);

        // Both scopes constrain `city`; conjoined they exclude everything.
        let contradictory = view.scope(&["north", "not_oslo"]).expect("scope");
        let teams = unwrap_outcome(coordinator.find_all(&cx, &contradictory, order()).await);
        assert!(teams.is_empty());

        let narrowed = unwrap_outcome(
            coordinator
                .find_all(&cx, &north, order().filter(Where::eq("name", "blues")))
                .await,
        );
        assert_eq!(names(&narrowed), vec!["blues"]);

        let err = view.scope(&["south"]).err().expect("unknown scope");
        assert!(matches!(err, Error::Request(_)));
    });
}
