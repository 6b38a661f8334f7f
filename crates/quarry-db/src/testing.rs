//! Sample models and a recording executor shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};

use quarry_core::QuarryResult;
use tokio::sync::Mutex;

use crate::executor::{DbExecutor, Returning};
use crate::model::{Definitions, Model};
use crate::query::compiler::DatabaseBackendType;
use crate::related::{ForeignKey, RelM2M, RelO2O, RelRevFK};
use crate::value::{Row, Value};

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

/// A model without a primary key.
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

/// Builds a row from column names and values.
pub fn row(columns: &[&str], values: Vec<Value>) -> Row {
    Row::new(columns.iter().map(|c| (*c).to_string()).collect(), values)
}

/// A mock executor that records statements and replays queued results.
pub struct MockDb {
    backend: DatabaseBackendType,
    returning: Returning,
    statements: Mutex<Vec<(String, Vec<Value>)>>,
    responses: StdMutex<VecDeque<Vec<Row>>>,
    next_id: AtomicI64,
}

impl MockDb {
    pub fn new(backend: DatabaseBackendType) -> Self {
        Self {
            backend,
            returning: Returning::LastInsertId,
            statements: Mutex::new(Vec::new()),
            responses: StdMutex::new(VecDeque::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Queues result sets returned by successive `query` calls.
    pub fn with_responses(self, responses: Vec<Vec<Row>>) -> Self {
        *self.responses.lock().unwrap_or_else(PoisonError::into_inner) = responses.into();
        self
    }

    pub fn with_returning(mut self, returning: Returning) -> Self {
        self.returning = returning;
        self
    }

    pub async fn statements(&self) -> Vec<(String, Vec<Value>)> {
        self.statements.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl DbExecutor for MockDb {
    fn backend_type(&self) -> DatabaseBackendType {
        self.backend
    }

    fn returning(&self) -> Returning {
        self.returning
    }

    async fn execute_sql(&self, sql: &str, params: &[Value]) -> QuarryResult<u64> {
        self.statements
            .lock()
            .await
            .push((sql.to_string(), params.to_vec()));
        Ok(1)
    }

    async fn query(&self, sql: &str, params: &[Value]) -> QuarryResult<Vec<Row>> {
        self.statements
            .lock()
            .await
            .push((sql.to_string(), params.to_vec()));
        let next = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        Ok(next.unwrap_or_default())
    }

    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> QuarryResult<Value> {
        self.statements
            .lock()
            .await
            .push((sql.to_string(), params.to_vec()));
        Ok(Value::Int(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }
}
