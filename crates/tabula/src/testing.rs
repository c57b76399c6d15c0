//! An in-memory [`Database`] for tests.
//!
//! Every statement is recorded. Responses are looked up by substring, in the
//! order they were registered; each pattern holds a queue of responses whose
//! last entry repeats. Unmatched queries return no rows and unmatched
//! statements succeed.

use crate::db::{BoxFuture, Database, DbError, Row};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

type Response = Result<Vec<Row>, DbError>;

#[derive(Debug, Default)]
pub struct ScriptedDb {
    log: Mutex<Vec<String>>,
    script: Mutex<Vec<(String, VecDeque<Response>)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer statements containing `pattern` with `rows`.
    pub fn respond(&self, pattern: impl Into<String>, rows: Vec<Row>) -> &Self {
        self.push(pattern.into(), Ok(rows))
    }

    /// Fail statements containing `pattern`.
    pub fn fail(&self, pattern: impl Into<String>, error: DbError) -> &Self {
        self.push(pattern.into(), Err(error))
    }

    fn push(&self, pattern: String, response: Response) -> &Self {
        let mut script = lock(&self.script);
        match script.iter_mut().find(|(p, _)| *p == pattern) {
            Some((_, queue)) => queue.push_back(response),
            None => script.push((pattern, VecDeque::from([response]))),
        }
        drop(script);
        self
    }

    /// Everything sent so far, in order.
    pub fn statements(&self) -> Vec<String> {
        lock(&self.log).clone()
    }

    /// Statements containing `pattern`.
    pub fn matching(&self, pattern: &str) -> Vec<String> {
        lock(&self.log)
            .iter()
            .filter(|sql| sql.contains(pattern))
            .cloned()
            .collect()
    }

    /// Position of the first statement containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        lock(&self.log).iter().position(|sql| sql.contains(pattern))
    }

    pub fn clear(&self) {
        lock(&self.log).clear();
    }

    fn answer(&self, sql: &str) -> Response {
        lock(&self.log).push(sql.to_string());
        let mut script = lock(&self.script);
        let Some((_, queue)) = script.iter_mut().find(|(p, _)| sql.contains(p.as_str())) else {
            return Ok(Vec::new());
        };
        if queue.len() > 1 {
            queue.pop_front().unwrap_or(Ok(Vec::new()))
        } else {
            queue.front().cloned().unwrap_or(Ok(Vec::new()))
        }
    }
}

impl Database for ScriptedDb {
    fn execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<(), DbError>> {
        let response = self.answer(sql).map(|_| ());
        Box::pin(async move { response })
    }

    fn query<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<Vec<Row>, DbError>> {
        let response = self.answer(sql);
        Box::pin(async move { response })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_responses() {
        let db = ScriptedDb::new();
        db.respond("SELECT 1", vec![Row::from_pairs([("one", Some("1"))])])
            .respond("SELECT 1", vec![])
            .fail("DROP", DbError::new("nope"));

        assert_eq!(db.query("SELECT 1 AS one").await.unwrap().len(), 1);
        assert!(db.query("SELECT 1 AS one").await.unwrap().is_empty());
        // the last response repeats
        assert!(db.query("SELECT 1 AS one").await.unwrap().is_empty());
        assert_eq!(db.execute("DROP TABLE t").await.unwrap_err().message, "nope");
        assert!(db.query("SELECT 2").await.unwrap().is_empty());

        assert_eq!(db.statements().len(), 5);
        assert_eq!(db.matching("SELECT 1").len(), 3);
        assert_eq!(db.position("DROP"), Some(3));
    }
}
