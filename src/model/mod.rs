pub mod field;
pub mod range;
pub mod record;
pub mod varint;

pub use field::{Field, FieldType, TimeUnit};
pub use range::{RangeSet, TimeRange};
pub use record::Record;
