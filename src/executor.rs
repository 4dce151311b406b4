use postgres::Client;

use crate::error::StatementSource;

/// Runs one statement at a time against the geometry store.
pub trait Executor {
    fn run(&mut self, statement: &str) -> Result<(), StatementSource>;

    /// Column names of a table or view, in table order.
    fn describe_columns(&mut self, table: &str) -> Result<Vec<String>, StatementSource>;
}

impl Executor for Client {
    fn run(&mut self, statement: &str) -> Result<(), StatementSource> {
        self.batch_execute(statement)?;
        Ok(())
    }

    fn describe_columns(&mut self, table: &str) -> Result<Vec<String>, StatementSource> {
        let statement = self.prepare(&format!("select * from {} limit 0", table))?;
        Ok(statement.columns().iter().map(|c| c.name().to_string()).collect())
    }
}

#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;

    use super::*;

    /// Records statements instead of running them.
    #[derive(Default)]
    pub struct RecordingExecutor {
        pub statements: Vec<String>,
        pub catalog: HashMap<String, Vec<String>>,
        pub fail_on: Option<String>,
    }

    impl RecordingExecutor {
        pub fn failing_on(fragment: &str) -> Self {
            RecordingExecutor { fail_on: Some(fragment.to_string()), ..Default::default() }
        }

        pub fn with_table(mut self, table: &str, columns: &[&str]) -> Self {
            self.catalog
                .insert(table.to_string(), columns.iter().map(|c| c.to_string()).collect());
            self
        }

        pub fn position(&self, fragment: &str) -> Option<usize> {
            self.statements.iter().position(|s| s.contains(fragment))
        }
    }

    impl Executor for RecordingExecutor {
        fn run(&mut self, statement: &str) -> Result<(), StatementSource> {
            if let Some(fragment) = &self.fail_on {
                if statement.contains(fragment.as_str()) {
                    return Err(format!("rejected: {}", statement).into());
                }
            }
            self.statements.push(statement.to_string());
            Ok(())
        }

        fn describe_columns(&mut self, table: &str) -> Result<Vec<String>, StatementSource> {
            self.catalog
                .get(table)
                .cloned()
                .ok_or_else(|| format!("relation \"{}\" does not exist", table).into())
        }
    }
}
