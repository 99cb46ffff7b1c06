use std::io::Read;

use csv::{DeserializeRecordsIntoIter, Trim};
use serde::Deserialize;

use crate::models::UserId;

/// One row of the user seed file.
#[derive(Debug, Deserialize)]
pub struct UserRow {
    pub user: UserId,
    pub card_number: Option<String>,
}

/// Parses a `user,card_number` CSV list. Rows are yielded with the line
/// they start on so errors can point at them.
pub struct CsvUserParser<R> {
    iter: DeserializeRecordsIntoIter<R, UserRow>,
}

impl<R> CsvUserParser<R>
where
    R: Read,
{
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .from_reader(source);

        Self {
            iter: reader.into_deserialize(),
        }
    }
}

impl<R> Iterator for CsvUserParser<R>
where
    R: Read,
{
    type Item = (u64, Result<UserRow, csv::Error>);

    fn next(&mut self) -> Option<Self::Item> {
        let curr_line = self.iter.reader().position().line();
        self.iter.next().map(|row| (curr_line, row))
    }
}
