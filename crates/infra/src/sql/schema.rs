//! Saga table creation.

use tracing::{info, instrument};

use postbus_sagas::{
    MAX_CORRELATION_KEY_LENGTH, MAX_CORRELATION_VALUE_LENGTH, MAX_SAGA_TYPE_LENGTH, SagaStoreError,
};

use super::connection::{DbConnection, DbConnectionProvider, map_sqlx_error};

/// Quote a configured table name for use in DDL/DML.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn contains_table(tables: &[String], name: &str) -> bool {
    tables.iter().any(|table| table.eq_ignore_ascii_case(name))
}

/// Create the data and index tables unless they already exist.
///
/// An index table without its data table means the name collides with an
/// unrelated table, which is reported as a configuration error.
#[instrument(skip(provider), err)]
pub async fn ensure_tables_are_created(
    provider: &dyn DbConnectionProvider,
    data_table: &str,
    index_table: &str,
) -> Result<(), SagaStoreError> {
    let mut conn = provider.connection().await?;
    let tables = conn.table_names().await?;
    let has_data = contains_table(&tables, data_table);
    let has_index = contains_table(&tables, index_table);

    match (has_data, has_index) {
        (true, true) => return Ok(()),
        (false, true) => {
            return Err(SagaStoreError::Configuration(format!(
                "index table '{index_table}' exists but data table '{data_table}' does not; \
                 the index table name collides with an unrelated table"
            )));
        }
        (false, false) => {
            info!(data_table, index_table, "creating saga tables");
            create_data_table(&mut conn, data_table).await?;
            create_index_table(&mut conn, data_table, index_table).await?;
        }
        (true, false) => {
            info!(index_table, "creating saga index table");
            create_index_table(&mut conn, data_table, index_table).await?;
        }
    }

    conn.complete().await
}

async fn create_data_table(conn: &mut DbConnection, data_table: &str) -> Result<(), SagaStoreError> {
    let sql = format!(
        r#"
        CREATE TABLE {data} (
            id TEXT NOT NULL PRIMARY KEY,
            revision INTEGER NOT NULL,
            data BLOB NOT NULL
        )
        "#,
        data = quote_identifier(data_table),
    );
    sqlx::query(&sql)
        .execute(conn.executor())
        .await
        .map_err(|e| map_sqlx_error("create_data_table", e))?;
    Ok(())
}

async fn create_index_table(
    conn: &mut DbConnection,
    data_table: &str,
    index_table: &str,
) -> Result<(), SagaStoreError> {
    let table = format!(
        r#"
        CREATE TABLE {index} (
            saga_type TEXT NOT NULL CHECK (length(saga_type) <= {type_len}),
            correlation_key TEXT NOT NULL CHECK (length(correlation_key) <= {key_len}),
            correlation_value TEXT NOT NULL CHECK (length(correlation_value) <= {value_len}),
            saga_id TEXT NOT NULL,
            PRIMARY KEY (saga_type, correlation_key, correlation_value),
            FOREIGN KEY (saga_id) REFERENCES {data} (id) ON DELETE CASCADE
        )
        "#,
        index = quote_identifier(index_table),
        data = quote_identifier(data_table),
        type_len = MAX_SAGA_TYPE_LENGTH,
        key_len = MAX_CORRELATION_KEY_LENGTH,
        value_len = MAX_CORRELATION_VALUE_LENGTH,
    );
    let reverse_lookup = format!(
        "CREATE INDEX {name} ON {index} (saga_id)",
        name = quote_identifier(&format!("ix_{index_table}_saga_id")),
        index = quote_identifier(index_table),
    );

    for (step, sql) in [("create_index_table", table), ("create_index_saga_id", reverse_lookup)] {
        sqlx::query(&sql)
            .execute(conn.executor())
            .await
            .map_err(|e| map_sqlx_error(step, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::connection::SqliteConnectionProvider;

    async fn provider() -> SqliteConnectionProvider {
        SqliteConnectionProvider::connect("sqlite::memory:").await.unwrap()
    }

    async fn tables(provider: &SqliteConnectionProvider) -> Vec<String> {
        provider.connection().await.unwrap().table_names().await.unwrap()
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_identifier("sagas"), "\"sagas\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[tokio::test]
    async fn creation_is_idempotent() {
        let provider = provider().await;
        ensure_tables_are_created(&provider, "sagas", "saga_index").await.unwrap();
        ensure_tables_are_created(&provider, "sagas", "saga_index").await.unwrap();

        let tables = tables(&provider).await;
        assert!(contains_table(&tables, "sagas"));
        assert!(contains_table(&tables, "saga_index"));
    }

    #[tokio::test]
    async fn missing_index_table_is_created() {
        let provider = provider().await;
        let mut conn = provider.connection().await.unwrap();
        create_data_table(&mut conn, "sagas").await.unwrap();
        conn.complete().await.unwrap();

        ensure_tables_are_created(&provider, "sagas", "saga_index").await.unwrap();
        assert!(contains_table(&tables(&provider).await, "saga_index"));
    }

    #[tokio::test]
    async fn index_table_without_data_table_is_rejected() {
        let provider = provider().await;
        let mut conn = provider.connection().await.unwrap();
        sqlx::query("CREATE TABLE saga_index (whatever TEXT)")
            .execute(conn.executor())
            .await
            .unwrap();
        conn.complete().await.unwrap();

        let err = ensure_tables_are_created(&provider, "sagas", "saga_index")
            .await
            .unwrap_err();
        assert!(matches!(err, SagaStoreError::Configuration(_)));
    }
}
