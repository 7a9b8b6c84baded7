pub mod datev;

pub use datev::{
    booking_rows, export_to_string, format_amount_de, format_date_de, tax_account, write_csv,
    BookingRow, BookingSide, ExportError, MatchedBooking, EXPORT_HEADER,
};
