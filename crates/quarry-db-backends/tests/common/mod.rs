//! Models and schema shared by the SQLite integration tests.

#![allow(dead_code)]

use quarry_db::model::{Definitions, Model};
use quarry_db::query::QuerySet;
use quarry_db::registry::Registry;
use quarry_db::related::{ForeignKey, RelM2M, RelO2O, RelRevFK};
use quarry_db_backends::{DatabaseBackend, SqliteBackend};

// ── Test model definitions ────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub todos: RelRevFK<Todo>,
    pub profile: RelO2O<Profile>,
    pub avatar: RelO2O<Image>,
}

impl Model for User {
    fn definitions() -> Definitions<Self> {
        Definitions::<Self>::new("User", "users")
            .field("ID", |u| &u.id, |u| &mut u.id)
            .primary_key()
            .field("Name", |u| &u.name, |u| &mut u.name)
            .reverse("TodoSet", |u| &mut u.todos)
            .reverse("Profile", |u| &mut u.profile)
            .one_to_one_through::<UserImage, _>("Avatar", "User", "Image", |u| &mut u.avatar)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Todo {
    pub id: i64,
    pub title: String,
    pub done: bool,
    pub user: ForeignKey<User>,
    pub tags: RelM2M<Tag>,
}

impl Model for Todo {
    fn definitions() -> Definitions<Self> {
        Definitions::<Self>::new("Todo", "todos")
            .field("ID", |t| &t.id, |t| &mut t.id)
            .primary_key()
            .field("Title", |t| &t.title, |t| &mut t.title)
            .field("Done", |t| &t.done, |t| &mut t.done)
            .foreign_key("User", |t| &t.user, |t| &mut t.user)
            .nullable()
            .many_to_many::<TodoTag, _>("Tags", "Todo", "Tag", |t| &mut t.tags)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub todos: RelM2M<Todo>,
}

impl Model for Tag {
    fn definitions() -> Definitions<Self> {
        Definitions::<Self>::new("Tag", "tags")
            .field("ID", |t| &t.id, |t| &mut t.id)
            .primary_key()
            .field("Name", |t| &t.name, |t| &mut t.name)
            .reverse("TodoSet", |t| &mut t.todos)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TodoTag {
    pub id: i64,
    pub todo: ForeignKey<Todo>,
    pub tag: ForeignKey<Tag>,
}

impl Model for TodoTag {
    fn definitions() -> Definitions<Self> {
        Definitions::<Self>::new("TodoTag", "todo_tags")
            .field("ID", |t| &t.id, |t| &mut t.id)
            .primary_key()
            .foreign_key("Todo", |t| &t.todo, |t| &mut t.todo)
            .foreign_key("Tag", |t| &t.tag, |t| &mut t.tag)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    pub id: i64,
    pub user: ForeignKey<User>,
    pub image: ForeignKey<Image>,
    pub bio: String,
}

impl Model for Profile {
    fn definitions() -> Definitions<Self> {
        Definitions::<Self>::new("Profile", "profiles")
            .field("ID", |p| &p.id, |p| &mut p.id)
            .primary_key()
            .one_to_one("User", |p| &p.user, |p| &mut p.user)
            .foreign_key("Image", |p| &p.image, |p| &mut p.image)
            .nullable()
            .field("Bio", |p| &p.bio, |p| &mut p.bio)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Image {
    pub id: i64,
    pub path: String,
}

impl Model for Image {
    fn definitions() -> Definitions<Self> {
        Definitions::<Self>::new("Image", "images")
            .field("ID", |i| &i.id, |i| &mut i.id)
            .primary_key()
            .field("Path", |i| &i.path, |i| &mut i.path)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserImage {
    pub id: i64,
    pub user: ForeignKey<User>,
    pub image: ForeignKey<Image>,
}

impl Model for UserImage {
    fn definitions() -> Definitions<Self> {
        Definitions::<Self>::new("UserImage", "user_images")
            .field("ID", |u| &u.id, |u| &mut u.id)
            .primary_key()
            .foreign_key("User", |u| &u.user, |u| &mut u.user)
            .foreign_key("Image", |u| &u.image, |u| &mut u.image)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub parent: ForeignKey<Category>,
    pub children: RelRevFK<Category>,
}

impl Model for Category {
    fn definitions() -> Definitions<Self> {
        Definitions::<Self>::new("Category", "categories")
            .field("ID", |c| &c.id, |c| &mut c.id)
            .primary_key()
            .field("Name", |c| &c.name, |c| &mut c.name)
            .foreign_key("Parent", |c| &c.parent, |c| &mut c.parent)
            .nullable()
            .reverse("CategorySet", |c| &mut c.children)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogLine {
    pub message: String,
    pub level: i64,
}

impl Model for LogLine {
    fn definitions() -> Definitions<Self> {
        Definitions::<Self>::new("LogLine", "log_lines")
            .field("Message", |l| &l.message, |l| &mut l.message)
            .field("Level", |l| &l.level, |l| &mut l.level)
    }
}

// ── Fixtures ──────────────────────────────────────────────────────────

const SCHEMA: &str = "
    CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
    CREATE TABLE images (id INTEGER PRIMARY KEY, path TEXT NOT NULL);
    CREATE TABLE profiles (
        id INTEGER PRIMARY KEY,
        user_id INTEGER NOT NULL UNIQUE REFERENCES users(id),
        image_id INTEGER REFERENCES images(id),
        bio TEXT NOT NULL DEFAULT ''
    );
    CREATE TABLE user_images (
        id INTEGER PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id),
        image_id INTEGER NOT NULL REFERENCES images(id)
    );
    CREATE TABLE todos (
        id INTEGER PRIMARY KEY,
        title TEXT NOT NULL,
        done BOOLEAN NOT NULL DEFAULT 0,
        user_id INTEGER REFERENCES users(id)
    );
    CREATE TABLE tags (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE);
    CREATE TABLE todo_tags (
        id INTEGER PRIMARY KEY,
        todo_id INTEGER NOT NULL REFERENCES todos(id),
        tag_id INTEGER NOT NULL REFERENCES tags(id)
    );
    CREATE TABLE categories (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        parent_id INTEGER REFERENCES categories(id)
    );
    CREATE TABLE log_lines (message TEXT NOT NULL, level INTEGER NOT NULL);
";

/// An isolated registry with every test model registered.
pub fn registry() -> Registry {
    let registry = Registry::new();
    registry.register_model::<Todo>().unwrap();
    registry.register_model::<Profile>().unwrap();
    registry.register_model::<Category>().unwrap();
    registry.register_model::<LogLine>().unwrap();
    registry
}

/// A fresh in-memory database with the test schema.
pub async fn database() -> SqliteBackend {
    let db = SqliteBackend::memory().unwrap();
    db.execute_batch(SCHEMA).await.unwrap();
    db
}

pub fn query<M: Model>(registry: &Registry) -> QuerySet<M> {
    QuerySet::with_registry(registry)
}

pub fn todo(title: &str, done: bool) -> Todo {
    Todo {
        title: title.to_string(),
        done,
        ..Todo::default()
    }
}

pub fn user(name: &str) -> User {
    User {
        name: name.to_string(),
        ..User::default()
    }
}
