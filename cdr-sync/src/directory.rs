use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use cdr_common::store::{StoreError, StoreResult};

/// Identifies a person in the destination system.
pub type PersonRef = i64;

/// A phone number on file for a person.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryNumber {
    pub number: String,
    pub person: PersonRef,
}

#[async_trait]
pub trait PersonDirectory: Send + Sync {
    /// Every number of the given phone type, these are the internal extensions.
    async fn numbers_of_type(&self, phone_type: &str) -> StoreResult<Vec<DirectoryNumber>>;

    /// The first person with a number containing `partial`.
    async fn find_by_partial_number(&self, partial: &str) -> StoreResult<Option<PersonRef>>;

    /// The person's first number of the given phone type.
    async fn number_of_person(
        &self,
        person: PersonRef,
        phone_type: &str,
    ) -> StoreResult<Option<String>>;
}

pub struct PgPersonDirectory {
    pool: PgPool,
}

impl PgPersonDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PersonDirectory for PgPersonDirectory {
    async fn numbers_of_type(&self, phone_type: &str) -> StoreResult<Vec<DirectoryNumber>> {
        let base_query = r#"
SELECT number, person_id
FROM phone_numbers
WHERE number_type = $1
ORDER BY id
        "#;

        let rows = sqlx::query(base_query)
            .bind(phone_type)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT phone_numbers".to_owned(),
                error,
            })?;

        rows.iter()
            .map(|row| {
                Ok(DirectoryNumber {
                    number: row.try_get("number")?,
                    person: row.try_get("person_id")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|error| StoreError::QueryError {
                command: "SELECT phone_numbers".to_owned(),
                error,
            })
    }

    async fn find_by_partial_number(&self, partial: &str) -> StoreResult<Option<PersonRef>> {
        let base_query = r#"
SELECT person_id
FROM phone_numbers
WHERE strpos(number, $1) > 0
ORDER BY person_id
LIMIT 1
        "#;

        sqlx::query_scalar(base_query)
            .bind(partial)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT phone_numbers".to_owned(),
                error,
            })
    }

    async fn number_of_person(
        &self,
        person: PersonRef,
        phone_type: &str,
    ) -> StoreResult<Option<String>> {
        let base_query = r#"
SELECT number
FROM phone_numbers
WHERE person_id = $1 AND number_type = $2
ORDER BY id
LIMIT 1
        "#;

        sqlx::query_scalar(base_query)
            .bind(person)
            .bind(phone_type)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT phone_numbers".to_owned(),
                error,
            })
    }
}
