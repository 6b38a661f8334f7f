//! Relation containers and nested materialization against SQLite.

mod common;

use common::{database, query, registry, todo, user, Category, Image, Profile, Tag, Todo, User};
use quarry_core::QuarryError;
use quarry_db::related::ForeignKey;
use quarry_db::{DbExecutor, Value};
use quarry_db_backends::SqliteBackend;

async fn seed_user(registry: &quarry_db::Registry, db: &SqliteBackend, name: &str) -> User {
    let mut u = user(name);
    query::<User>(registry).create(&mut u, db).await.unwrap();
    u
}

async fn seed_tag(registry: &quarry_db::Registry, db: &SqliteBackend, name: &str) -> Tag {
    let mut tag = Tag {
        name: name.to_string(),
        ..Tag::default()
    };
    query::<Tag>(registry).create(&mut tag, db).await.unwrap();
    tag
}

#[tokio::test]
async fn test_reverse_foreign_key_mirrors_forward() {
    let registry = registry();
    let db = database().await;

    let user_meta = registry.get_model_meta::<User>().unwrap();
    let todo_meta = registry.get_model_meta::<Todo>().unwrap();
    let reverse = user_meta.reverse("TodoSet").unwrap();
    assert_eq!(reverse.model(), Some(todo_meta.key()));
    assert!(reverse.relation_type().is_to_many());
    assert!(todo_meta.forward("User").is_some());

    let mut ann = seed_user(&registry, &db, "Ann").await;
    let bob = seed_user(&registry, &db, "Bob").await;
    let todos = query::<Todo>(&registry);
    for (title, owner) in [("a", ann.id), ("b", ann.id), ("c", bob.id)] {
        let mut t = todo(title, false);
        t.user = ForeignKey::new(owner);
        todos.create(&mut t, &db).await.unwrap();
    }

    assert_eq!(ann.todos.objects().count(&db).await.unwrap(), 2);
    assert!(!ann.todos.is_loaded());
    let loaded = ann.todos.load(&db).await.unwrap();
    let mut titles: Vec<_> = loaded.iter().map(|t| t.title.clone()).collect();
    titles.sort();
    assert_eq!(titles, vec!["a", "b"]);
    assert!(loaded.iter().all(|t| t.user.id() == &Value::Int(ann.id)));

    let from_child = todos.filter("User.Name", "Ann").count(&db).await.unwrap();
    let from_parent = query::<User>(&registry)
        .filter("TodoSet.Title", "c")
        .values_list(&db)
        .await
        .unwrap();
    assert_eq!(from_child, 2);
    assert_eq!(from_parent.len(), 1);
    assert_eq!(from_parent[0][0], Value::Int(bob.id));
}

#[tokio::test]
async fn test_many_to_many_is_symmetric() {
    let registry = registry();
    let db = database().await;
    let todos = query::<Todo>(&registry);

    let mut first = todo("first", false);
    let mut second = todo("second", false);
    todos.create(&mut first, &db).await.unwrap();
    todos.create(&mut second, &db).await.unwrap();
    let home = seed_tag(&registry, &db, "home").await;
    let work = seed_tag(&registry, &db, "work").await;

    assert!(first.tags.add_target(&home, &db).await.unwrap());
    assert!(!first.tags.add_target(&home, &db).await.unwrap());
    assert!(first.tags.add_target(&work, &db).await.unwrap());
    assert!(second.tags.add_target(&home, &db).await.unwrap());

    assert_eq!(first.tags.objects().count(&db).await.unwrap(), 2);
    let mut home = query::<Tag>(&registry).filter("Name", "home").get(&db).await.unwrap();
    let mut tagged: Vec<_> = home
        .todos
        .load(&db)
        .await
        .unwrap()
        .iter()
        .map(|t| t.title.clone())
        .collect();
    tagged.sort();
    assert_eq!(tagged, vec!["first", "second"]);
    assert_eq!(
        todos.filter("Tags.Name", "work").values_list(&db).await.unwrap().len(),
        1
    );

    assert!(home.todos.remove_target(&second, &db).await.unwrap());
    assert!(!home.todos.remove_target(&second, &db).await.unwrap());
    assert_eq!(home.todos.len(), 1);
    assert_eq!(second.tags.objects().count(&db).await.unwrap(), 0);

    assert_eq!(first.tags.clear_targets(&db).await.unwrap(), 2);
    assert!(first.tags.is_loaded());
    assert!(first.tags.is_empty());
    assert_eq!(home.todos.objects().count(&db).await.unwrap(), 0);
    assert_eq!(query::<Tag>(&registry).count(&db).await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_add_target_links_once() {
    let registry = registry();
    let db = database().await;
    let mut first = todo("first", false);
    query::<Todo>(&registry).create(&mut first, &db).await.unwrap();
    let home = seed_tag(&registry, &db, "home").await;

    let mut a = first.clone();
    let mut b = first.clone();
    let (left, right) = tokio::join!(a.tags.add_target(&home, &db), b.tags.add_target(&home, &db));
    let added = [left.unwrap(), right.unwrap()];
    assert_eq!(added.iter().filter(|inserted| **inserted).count(), 1);

    let links = db
        .query("SELECT COUNT(*) AS n FROM todo_tags", &[])
        .await
        .unwrap();
    assert_eq!(links[0].get::<i64>("n").unwrap(), 1);
}

#[tokio::test]
async fn test_one_to_one_through_replaces_link() {
    let registry = registry();
    let db = database().await;
    let mut ann = seed_user(&registry, &db, "Ann").await;
    let images = query::<Image>(&registry);
    let mut old = Image {
        path: "old.png".into(),
        ..Image::default()
    };
    let mut new = Image {
        path: "new.png".into(),
        ..Image::default()
    };
    images.create(&mut old, &db).await.unwrap();
    images.create(&mut new, &db).await.unwrap();

    ann.avatar.set_target(&old, &db).await.unwrap();
    ann.avatar.set_target(&new, &db).await.unwrap();
    assert_eq!(ann.avatar.get().map(|i| i.path.as_str()), Some("new.png"));

    let links = db
        .query("SELECT COUNT(*) AS n FROM user_images", &[])
        .await
        .unwrap();
    assert_eq!(links[0].get::<i64>("n").unwrap(), 1);
    let current = ann.avatar.objects().get(&db).await.unwrap();
    assert_eq!(current.id, new.id);
}

#[tokio::test]
async fn test_plain_reverse_one_to_one_is_read_only() {
    let registry = registry();
    let db = database().await;
    let mut ann = seed_user(&registry, &db, "Ann").await;
    let mut profile = Profile {
        user: ForeignKey::new(ann.id),
        bio: "hi".into(),
        ..Profile::default()
    };
    query::<Profile>(&registry).create(&mut profile, &db).await.unwrap();

    let err = ann.profile.set_target(&profile, &db).await.unwrap_err();
    assert!(matches!(err, QuarryError::NotImplemented(_)));
    assert_eq!(ann.profile.objects().get(&db).await.unwrap().bio, "hi");
}

#[tokio::test]
async fn test_nested_selection_materializes_each_hop() {
    let registry = registry();
    let db = database().await;
    let ann = seed_user(&registry, &db, "Ann").await;
    let mut image = Image {
        path: "ann.png".into(),
        ..Image::default()
    };
    query::<Image>(&registry).create(&mut image, &db).await.unwrap();
    let mut profile = Profile {
        user: ForeignKey::new(ann.id),
        image: ForeignKey::new(image.id),
        bio: "hello".into(),
        ..Profile::default()
    };
    query::<Profile>(&registry).create(&mut profile, &db).await.unwrap();
    let mut t = todo("write", false);
    t.user = ForeignKey::new(ann.id);
    query::<Todo>(&registry).create(&mut t, &db).await.unwrap();

    let fetched = query::<Todo>(&registry)
        .select(&["*", "User.*", "User.Profile.*", "User.Profile.Image.*"])
        .get(&db)
        .await
        .unwrap();
    let owner = fetched.user.get().unwrap();
    assert_eq!(owner.name, "Ann");
    let owner_profile = owner.profile.get().unwrap();
    assert_eq!(owner_profile.bio, "hello");
    assert_eq!(owner_profile.image.get().unwrap().path, "ann.png");

    assert_eq!(owner.todos.objects().count(&db).await.unwrap(), 1);
    assert_eq!(owner.profile.objects().count(&db).await.unwrap(), 1);
    let again = owner_profile.user.clone().fetch(&db).await.unwrap().map(|u| u.id);
    assert_eq!(again, Some(ann.id));
}

#[tokio::test]
async fn test_to_many_selection_merges_rows() {
    let registry = registry();
    let db = database().await;
    let ann = seed_user(&registry, &db, "Ann").await;
    seed_user(&registry, &db, "Bob").await;
    for title in ["a", "b", "c"] {
        let mut t = todo(title, false);
        t.user = ForeignKey::new(ann.id);
        query::<Todo>(&registry).create(&mut t, &db).await.unwrap();
    }

    let users = query::<User>(&registry)
        .select(&["*", "TodoSet.*"])
        .order_by(&["ID"])
        .all(&db)
        .await
        .unwrap();
    assert_eq!(users.len(), 2);
    assert_eq!(users[0].name, "Ann");
    let mut titles: Vec<_> = users[0].todos.as_list().iter().map(|t| t.title.as_str()).collect();
    titles.sort_unstable();
    assert_eq!(titles, vec!["a", "b", "c"]);
    assert!(users[1].todos.is_empty());
}

#[tokio::test]
async fn test_self_reference_aliases_are_stable() {
    let registry = registry();
    let db = database().await;
    let categories = query::<Category>(&registry);
    let mut root = Category {
        name: "root".into(),
        ..Category::default()
    };
    categories.create(&mut root, &db).await.unwrap();
    let mut mid = Category {
        name: "mid".into(),
        parent: ForeignKey::new(root.id),
        ..Category::default()
    };
    categories.create(&mut mid, &db).await.unwrap();
    let mut leaf = Category {
        name: "leaf".into(),
        parent: ForeignKey::new(mid.id),
        ..Category::default()
    };
    categories.create(&mut leaf, &db).await.unwrap();

    let grandchildren = categories.filter("Parent.Parent.Name", "root");
    let first = grandchildren.sql(quarry_db::DatabaseBackendType::SQLite).unwrap();
    let second = grandchildren.sql(quarry_db::DatabaseBackendType::SQLite).unwrap();
    assert_eq!(first, second);
    assert!(first.sql.contains(r#""categories" AS "T_categories""#));
    assert!(first.sql.contains(r#""categories" AS "T1_categories""#));

    let found = grandchildren.all(&db).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name, "leaf");
    assert_eq!(root.children.objects().count(&db).await.unwrap(), 1);
}
