/*
 * Helper macros for creating type-safe functions that wrap static SQLite SQL
 * statements in Rusqlite accessors. The generated functions expect
 * `rusqlite::{Connection, ToSql, Result as RusqliteResult}` to be in scope at
 * the call site. Statements built at runtime (table names come from the asset
 * schema) are prepared directly instead.
 */

// Executes a non-query SQL command (ATTACH, DELETE, ...) with type-safe bind parameters
#[macro_export]
macro_rules! execute_sql {
    ($func_name:ident, $sql:expr, $($param_name:ident : $param_type:ty),*) => {
        pub fn $func_name(conn: &Connection $(, $param_name: $param_type)*) -> RusqliteResult<usize> {
            let mut stmt = conn.prepare_cached($sql)?;
            let params = [$(&$param_name as &dyn ToSql),*];
            let affected_rows = stmt.execute(params)?;
            Ok(affected_rows)
        }
    };
}

// Executes a non-query SQL command without bind parameters
#[macro_export]
macro_rules! execute_sql_no_args {
    ($func_name:ident, $sql:expr) => {
        pub fn $func_name(conn: &Connection) -> RusqliteResult<usize> {
            let mut stmt = conn.prepare_cached($sql)?;
            let affected_rows = stmt.execute([])?;
            Ok(affected_rows)
        }
    };
}

// Executes multiple statements in a batch without any arguments
#[macro_export]
macro_rules! execute_sql_batch {
    ($func_name:ident, $sql:expr) => {
        pub fn $func_name(conn: &Connection) -> RusqliteResult<()> {
            conn.execute_batch($sql)?;
            Ok(())
        }
    };
}

// Runs a query that returns a single value without bind parameters
#[macro_export]
macro_rules! query_sql_single_no_args {
    ($func_name:ident, $sql:expr; $out_name:ident : $out_type:ty) => {
        pub fn $func_name(conn: &Connection) -> RusqliteResult<$out_type> {
            let mut stmt = conn.prepare_cached($sql)?;
            let mut rows = stmt.query([])?;

            if let Some(row) = rows.next()? {
                Ok(row.get::<_, $out_type>(0)?)
            } else {
                Err(rusqlite::Error::QueryReturnedNoRows)
            }
        }
    };
}

// Runs a query and calls a closure for each row without bind parameters
#[macro_export]
macro_rules! query_sql_rows_no_args {
    ($func_name:ident, $sql:expr; $out_name:ident : $out_type:ty) => {
        pub fn $func_name<F>(conn: &Connection, mut callback: F) -> RusqliteResult<()>
        where
            F: FnMut(usize, $out_type) -> RusqliteResult<()>,
        {
            let mut stmt = conn.prepare_cached($sql)?;
            let mut rows = stmt.query([])?;
            let mut row_index = 0;
            while let Some(row) = rows.next()? {
                let value = row.get::<_, $out_type>(0)?;
                callback(row_index, value)?;
                row_index += 1;
            }
            Ok(())
        }
    };
}
