use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::iter;
use std::path::Path;
use thiserror::Error;

use crate::geo::Coordinate;
use crate::model::{PartyId, RideBooking};

/// Errors that can occur when reading a script or writing the report
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("cannot open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized command '{op}'")]
    UnknownOp { line: usize, op: String },

    #[error("line {line}: {op} missing {field}")]
    MissingField {
        line: usize,
        op: String,
        field: &'static str,
    },

    #[error("failed to write report: {0}")]
    Output(#[from] io::Error),
}

/// One scripted user action. `ride` is a label local to the script.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Request {
        passenger: PartyId,
        ride: String,
        origin: Coordinate,
        destination: Coordinate,
    },
    /// `position`, when given, is where the driver is; the ride must then
    /// be within the search radius.
    Accept {
        driver: PartyId,
        ride: String,
        position: Option<Coordinate>,
    },
    Fund {
        passenger: PartyId,
        ride: String,
        fare: f64,
    },
    Complete {
        actor: PartyId,
        ride: String,
    },
    Cancel {
        actor: PartyId,
        ride: String,
    },
}

impl Command {
    pub fn actor(&self) -> &PartyId {
        match self {
            Command::Request { passenger, .. } | Command::Fund { passenger, .. } => passenger,
            Command::Accept { driver, .. } => driver,
            Command::Complete { actor, .. } | Command::Cancel { actor, .. } => actor,
        }
    }

    pub fn ride(&self) -> &str {
        match self {
            Command::Request { ride, .. }
            | Command::Accept { ride, .. }
            | Command::Fund { ride, .. }
            | Command::Complete { ride, .. }
            | Command::Cancel { ride, .. } => ride,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InputRow {
    op: String,
    actor: PartyId,
    ride: String,
    lat: Option<f64>,
    lng: Option<f64>,
    dest_lat: Option<f64>,
    dest_lng: Option<f64>,
    fare: Option<f64>,
}

#[derive(Debug, Serialize)]
struct OutputRow<'a> {
    ride: &'a str,
    status: &'static str,
    passenger: &'a str,
    driver: &'a str,
    passenger_completed: bool,
    driver_completed: bool,
    escrow_state: &'static str,
}

impl InputRow {
    fn require(
        value: Option<f64>,
        line: usize,
        op: &str,
        field: &'static str,
    ) -> Result<f64, ScriptError> {
        value.ok_or_else(|| ScriptError::MissingField {
            line,
            op: op.to_string(),
            field,
        })
    }

    fn into_command(self, line: usize) -> Result<Command, ScriptError> {
        let op = self.op.as_str();
        match op {
            "request" => Ok(Command::Request {
                origin: Coordinate::new(
                    Self::require(self.lat, line, op, "lat")?,
                    Self::require(self.lng, line, op, "lng")?,
                ),
                destination: Coordinate::new(
                    Self::require(self.dest_lat, line, op, "dest_lat")?,
                    Self::require(self.dest_lng, line, op, "dest_lng")?,
                ),
                passenger: self.actor,
                ride: self.ride,
            }),
            "accept" => Ok(Command::Accept {
                position: self.lat.zip(self.lng).map(|(lat, lng)| Coordinate::new(lat, lng)),
                driver: self.actor,
                ride: self.ride,
            }),
            "fund" => Ok(Command::Fund {
                fare: Self::require(self.fare, line, op, "fare")?,
                passenger: self.actor,
                ride: self.ride,
            }),
            "complete" => Ok(Command::Complete {
                actor: self.actor,
                ride: self.ride,
            }),
            "cancel" => Ok(Command::Cancel {
                actor: self.actor,
                ride: self.ride,
            }),
            other => Err(ScriptError::UnknownOp {
                line,
                op: other.to_string(),
            }),
        }
    }
}

/// Commands read from a csv script, one per data row.
///
/// Owns its reader, so it can be handed to another thread once opened.
pub struct Commands {
    rows: iter::Enumerate<csv::DeserializeRecordsIntoIter<File, InputRow>>,
}

impl Iterator for Commands {
    type Item = Result<Command, ScriptError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (idx, result) = self.rows.next()?;
        let line = idx + 2; // 1-indexed, skip header
        Some(
            result
                .map_err(|source| ScriptError::Parse { line, source })
                .and_then(|row| row.into_command(line)),
        )
    }
}

/// Read commands from a csv script
pub fn read_commands(path: impl AsRef<Path>) -> Result<Commands, ScriptError> {
    let path = path.as_ref();
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| ScriptError::Open {
            path: path.display().to_string(),
            source,
        })?;

    Ok(Commands {
        rows: reader.into_deserialize().enumerate(),
    })
}

/// Write the final state of labelled bookings in csv format
pub fn write_bookings<'a>(
    writer: impl io::Write,
    bookings: impl IntoIterator<Item = (&'a str, &'a RideBooking)>,
) -> Result<(), ScriptError> {
    let mut writer = csv::Writer::from_writer(writer);

    for (ride, booking) in bookings {
        let row = OutputRow {
            ride,
            status: booking.status.as_str(),
            passenger: booking.passenger_id.as_str(),
            driver: booking.driver_id.as_ref().map_or("", PartyId::as_str),
            passenger_completed: booking.passenger_completed,
            driver_completed: booking.driver_completed,
            escrow_state: booking.escrow_state.as_str(),
        };
        writer.serialize(&row).map_err(io::Error::from)?;
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EscrowState, NewBooking, RideStatus};
    use chrono::Utc;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str = "op,actor,ride,lat,lng,dest_lat,dest_lng,fare\n";

    fn write_csv(rows: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(HEADER.as_bytes()).unwrap();
        file.write_all(rows.as_bytes()).unwrap();
        file
    }

    fn read(rows: &str) -> Vec<Result<Command, ScriptError>> {
        let file = write_csv(rows);
        read_commands(file.path()).unwrap().collect()
    }

    #[test]
    fn read_request() {
        let results = read("request,p1,r1,28.61,77.20,28.70,77.30,\n");
        assert_eq!(results.len(), 1);

        match results.into_iter().next().unwrap().unwrap() {
            Command::Request {
                passenger,
                ride,
                origin,
                destination,
            } => {
                assert_eq!(passenger, PartyId::new("p1"));
                assert_eq!(ride, "r1");
                assert_eq!(origin, Coordinate::new(28.61, 77.20));
                assert_eq!(destination, Coordinate::new(28.70, 77.30));
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn read_accept_with_and_without_position() {
        let results = read("accept,d1,r1,28.61,77.20,,,\naccept,d2,r2,,,,,\n");
        let commands: Vec<_> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            commands[0],
            Command::Accept {
                driver: PartyId::new("d1"),
                ride: "r1".into(),
                position: Some(Coordinate::new(28.61, 77.20)),
            }
        );
        assert!(matches!(commands[1], Command::Accept { position: None, .. }));
    }

    #[test]
    fn read_with_whitespace() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            "op, actor, ride, lat, lng, dest_lat, dest_lng, fare\nfund, p1, r1, , , , , 120.5\n",
        )
        .unwrap();
        let results: Vec<_> = read_commands(file.path()).unwrap().collect();
        assert!(matches!(results[0], Ok(Command::Fund { fare, .. }) if fare == 120.5));
    }

    #[test]
    fn read_returns_error_for_unknown_op() {
        let results = read("teleport,p1,r1,,,,,\n");
        let err = results[0].as_ref().unwrap_err();
        assert!(matches!(err, ScriptError::UnknownOp { line: 2, .. }));
    }

    #[test]
    fn read_returns_error_for_missing_field() {
        let results = read("complete,p1,r1,,,,,\nfund,p1,r1,,,,,\n");
        assert!(results[0].is_ok());
        let err = results[1].as_ref().unwrap_err();
        assert!(matches!(err, ScriptError::MissingField { line: 3, field: "fare", .. }));
    }

    #[test]
    fn commands_outlive_the_path() {
        let file = write_csv("complete,p1,r1,,,,,\ncancel,d1,r1,,,,,\n");
        let commands = {
            let path = file.path().display().to_string();
            read_commands(&path).unwrap()
        };
        let handle = std::thread::spawn(move || commands.map(Result::unwrap).collect::<Vec<_>>());
        let commands = handle.join().unwrap();
        assert_eq!(commands.len(), 2);
        assert!(matches!(commands[1], Command::Cancel { .. }));
    }

    #[test]
    fn read_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_commands(dir.path().join("absent.csv"));
        assert!(matches!(result, Err(ScriptError::Open { .. })));
    }

    #[test]
    fn write_report() {
        let mut booking = RideBooking::from_request(
            NewBooking::new(
                PartyId::new("p1"),
                Coordinate::new(28.6, 77.2),
                Coordinate::new(28.7, 77.3),
            ),
            Utc::now(),
        );
        booking.status = RideStatus::Completed;
        booking.driver_id = Some(PartyId::new("d1"));
        booking.passenger_completed = true;
        booking.driver_completed = true;
        booking.escrow_state = EscrowState::Released;
        let waiting = RideBooking::from_request(
            NewBooking::new(
                PartyId::new("p2"),
                Coordinate::new(28.6, 77.2),
                Coordinate::new(28.7, 77.3),
            ),
            Utc::now(),
        );

        let mut out = Vec::new();
        write_bookings(&mut out, [("r1", &booking), ("r2", &waiting)]).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "ride,status,passenger,driver,passenger_completed,driver_completed,escrow_state",
                "r1,completed,p1,d1,true,true,released",
                "r2,waiting,p2,,false,false,none",
            ]
        );
    }
}
