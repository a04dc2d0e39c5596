//! Minimal SELECT builder for the reference tables.
//!
//! Produces `SELECT cols FROM table [WHERE cond]` strings that are fed to
//! `sqlx::query_as`, whose `FromRow` derive fills the row structs column by
//! column.

#[derive(Debug, Clone)]
pub struct Select {
    table: &'static str,
    columns: &'static str,
    condition: Option<&'static str>,
}

impl Select {
    pub fn from(table: &'static str) -> Self {
        Self {
            table,
            columns: "*",
            condition: None,
        }
    }

    pub fn columns(mut self, columns: &'static str) -> Self {
        self.columns = columns;
        self
    }

    pub fn filter(mut self, condition: &'static str) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn sql(&self) -> String {
        match self.condition {
            Some(condition) => format!(
                "SELECT {} FROM {} WHERE {}",
                self.columns, self.table, condition
            ),
            None => format!("SELECT {} FROM {}", self.columns, self.table),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_select() {
        assert_eq!(Select::from("user").sql(), "SELECT * FROM user");
    }

    #[test]
    fn filtered_select_with_columns() {
        let sql = Select::from("file")
            .columns("id, checksum")
            .filter("user_id = ?")
            .sql();
        assert_eq!(sql, "SELECT id, checksum FROM file WHERE user_id = ?");
    }
}
