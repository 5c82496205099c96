mod unlocker;
pub use unlocker::ReservationSweeper;
