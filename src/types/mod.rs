//! Plain value types shared by every layer of the pipeline: points, bounding
//! volumes, colours and the ion-hit record itself.

mod bound;
mod colour;
mod ion;
mod point;

pub use bound::BoundingBox;
pub use colour::Colour;
pub use ion::IonHit;
pub use point::Point3;
