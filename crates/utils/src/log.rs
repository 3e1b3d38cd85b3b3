// This file is part of Quay.
//
// Quay is free software: you can redistribute it and/or modify it under the
// terms of the GNU Lesser General Public License as published by the Free Software
// Foundation, either version 3 of the License, or (at your option) any later version.
//
// Quay is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with Quay.
// If not, see https://www.gnu.org/licenses/.

//! Helpers for logging errors where they are handled rather than propagated

use std::fmt::{Debug, Display};

use tracing::Level;

/// Logs the error of a result-like value and hands the value back unchanged
pub trait LogOnError {
    /// Log at `ERROR` if there is an error
    fn log_on_error<C>(self, context: C) -> Self
    where
        C: Display;

    /// Log at `level` if there is an error
    fn log_on_error_level<C>(self, level: Level, context: C) -> Self
    where
        C: Display;
}

impl<T, E> LogOnError for Result<T, E>
where
    E: Debug,
{
    fn log_on_error<C>(self, context: C) -> Self
    where
        C: Display,
    {
        self.log_on_error_level(Level::ERROR, context)
    }

    fn log_on_error_level<C>(self, level: Level, context: C) -> Self
    where
        C: Display,
    {
        if let Err(error) = &self {
            log_at_level(level, &format!("{context}: {error:?}"));
        }
        self
    }
}

fn log_at_level(level: Level, s: &str) {
    match level {
        Level::TRACE => tracing::trace!("{s}"),
        Level::DEBUG => tracing::debug!("{s}"),
        Level::INFO => tracing::info!("{s}"),
        Level::WARN => tracing::warn!("{s}"),
        Level::ERROR => tracing::error!("{s}"),
    }
}
