use crate::commands::ReserveSdrRepository;
use crate::error::{Error, Result};
use crate::transport::CommandChannel;

use super::{COMPLETION_CODE_RESERVATION_CANCELLED, MAX_RESERVATION_RETRIES};

/// Ask the repository for a fresh reservation id.
pub fn acquire_reservation<C: CommandChannel>(channel: &C) -> Result<u16> {
    channel.execute(ReserveSdrRepository)
}

/// A repository reservation that renews itself when the BMC cancels it.
///
/// The BMC may invalidate a reservation at any time (any repository write
/// does). Only completion code 0xC5 triggers a renewal, and at most
/// [`MAX_RESERVATION_RETRIES`] renewals are made per phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    id: u16,
    retries: u32,
    renewals: u32,
}

impl Reservation {
    /// Acquire the initial reservation.
    pub fn acquire<C: CommandChannel>(channel: &C) -> Result<Self> {
        Ok(Self {
            id: acquire_reservation(channel)?,
            retries: 0,
            renewals: 0,
        })
    }

    /// Current reservation id.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Renewals made over the lifetime of this reservation.
    pub fn renewals(&self) -> u32 {
        self.renewals
    }

    /// Start a new phase with a fresh retry budget.
    pub fn reset_retries(&mut self) {
        self.retries = 0;
    }

    /// Handle a failed command.
    ///
    /// Returns `Ok(())` after renewing the reservation when `err` is a
    /// cancellation and the budget allows; the caller then retries the same
    /// command. Any other error is returned unchanged.
    pub fn recover<C: CommandChannel>(&mut self, channel: &C, err: Error) -> Result<()> {
        if err.completion_code() != Some(COMPLETION_CODE_RESERVATION_CANCELLED) {
            return Err(err);
        }
        if self.retries >= MAX_RESERVATION_RETRIES {
            return Err(Error::ReservationRetriesExhausted {
                attempts: self.retries,
            });
        }

        self.id = acquire_reservation(channel)?;
        self.retries += 1;
        self.renewals += 1;
        crate::observe::reservation_renewed(self.id, self.retries);
        Ok(())
    }
}
