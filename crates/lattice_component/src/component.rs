//! Component trait and the authored component set.
//!
//! Every component is a serde struct with a stable string name. Bytes are
//! stored as **named** (map-style) MessagePack in the entity hash, keyed
//! by that name, so the stored form is self-describing and stable across
//! field reordering. The component set is closed and enumerated here —
//! there is no runtime reflection.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::StoreError;

/// A typed record attached to an entity.
///
/// At most one instance of each component type exists per entity; the
/// primary key is `(entity, NAME)`. Missing bytes decode to the
/// component's `Default`, which is what an index co-fetch yields for
/// entities that lack the component.
pub trait Component:
    Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static
{
    /// Stable type name, used as the hash field and the
    /// `by_component:{NAME}` index key suffix.
    const NAME: &'static str;
}

/// Encode a component to named (map-style) MessagePack bytes.
///
/// # Errors
///
/// Returns [`StoreError::Encode`] if serialisation fails.
pub fn encode<C: Component>(component: &C) -> Result<Vec<u8>, StoreError> {
    Ok(rmp_serde::to_vec_named(component)?)
}

/// Decode a component from MessagePack bytes.
///
/// Empty input decodes to the component's default value.
///
/// # Errors
///
/// Returns [`StoreError::Decode`] if deserialisation fails.
pub fn decode<C: Component>(bytes: &[u8]) -> Result<C, StoreError> {
    if bytes.is_empty() {
        return Ok(C::default());
    }
    Ok(rmp_serde::from_slice(bytes)?)
}

/// A component in wire form: its type name plus encoded bytes.
///
/// This is what registry observers receive, so they can react to
/// component types they care about without the registry knowing about
/// them.
#[derive(Debug, Clone)]
pub struct RawComponent {
    /// The component type name.
    pub name: String,
    /// Named MessagePack bytes. Empty bytes stand for the default value.
    pub bytes: Vec<u8>,
}

impl RawComponent {
    /// Encode a typed component into wire form.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Encode`] if serialisation fails.
    pub fn of<C: Component>(component: &C) -> Result<Self, StoreError> {
        Ok(Self {
            name: C::NAME.to_string(),
            bytes: encode(component)?,
        })
    }

    /// Returns `true` if this raw component is of type `C`.
    #[must_use]
    pub fn is<C: Component>(&self) -> bool {
        self.name == C::NAME
    }

    /// Decode into a typed component.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Decode`] if deserialisation fails.
    pub fn decode<C: Component>(&self) -> Result<C, StoreError> {
        decode(&self.bytes)
    }
}

/// A set of components read or written together in a single backend call.
///
/// Implemented for `()` (no components) and for tuples of up to six
/// components. Reads decode missing fields to defaults; the whole-hash
/// absent case is reported by the store as [`StoreError::NotFound`]
/// before decoding starts.
pub trait ComponentBundle: Sized + Send {
    /// The component names, in field order.
    fn names() -> Vec<&'static str>;

    /// Encode every component into wire form, in field order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Encode`] if any component fails to encode.
    fn to_raw(&self) -> Result<Vec<RawComponent>, StoreError>;

    /// Decode from per-field rows, parallel to [`Self::names`]. Missing
    /// rows become defaults.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Decode`] if any present row fails to decode.
    fn from_rows(rows: &[Option<Vec<u8>>]) -> Result<Self, StoreError>;
}

impl ComponentBundle for () {
    fn names() -> Vec<&'static str> {
        Vec::new()
    }

    fn to_raw(&self) -> Result<Vec<RawComponent>, StoreError> {
        Ok(Vec::new())
    }

    fn from_rows(_rows: &[Option<Vec<u8>>]) -> Result<Self, StoreError> {
        Ok(())
    }
}

macro_rules! impl_bundle_for_tuple {
    ($($ty:ident => $idx:tt),+) => {
        impl<$($ty: Component),+> ComponentBundle for ($($ty,)+) {
            fn names() -> Vec<&'static str> {
                vec![$($ty::NAME),+]
            }

            fn to_raw(&self) -> Result<Vec<RawComponent>, StoreError> {
                Ok(vec![$(RawComponent::of(&self.$idx)?),+])
            }

            fn from_rows(rows: &[Option<Vec<u8>>]) -> Result<Self, StoreError> {
                Ok(($(
                    match rows.get($idx).and_then(|row| row.as_deref()) {
                        Some(bytes) => decode::<$ty>(bytes)?,
                        None => $ty::default(),
                    },
                )+))
            }
        }
    };
}

impl_bundle_for_tuple!(A => 0);
impl_bundle_for_tuple!(A => 0, B => 1);
impl_bundle_for_tuple!(A => 0, B => 1, C => 2);
impl_bundle_for_tuple!(A => 0, B => 1, C => 2, D => 3);
impl_bundle_for_tuple!(A => 0, B => 1, C => 2, D => 3, E => 4);
impl_bundle_for_tuple!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5);

// ── The authored component set ──────────────────────────────────────────────

/// Grid position. Presence places the entity in the spatial index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i64,
    pub y: i64,
}

impl Component for Position {
    const NAME: &'static str = "Position";
}

/// Per-tick velocity. Presence makes the entity participate in the
/// movement pass; zero velocity means stationary but still eligible.
/// Only meaningful together with [`Position`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Moveable {
    pub vel_x: i64,
    pub vel_y: i64,
}

impl Moveable {
    /// Returns `true` when both velocity components are zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.vel_x == 0 && self.vel_y == 0
    }
}

impl Component for Moveable {
    const NAME: &'static str = "Moveable";
}

/// Visual representation. Presence makes the entity visible to lookers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Render {
    /// The glyph drawn for this entity.
    pub ch: String,
    /// RGBA colour.
    pub color: u32,
}

impl Component for Render {
    const NAME: &'static str = "Render";
}

/// The entity observes others within `range`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Looker {
    pub range: f32,
}

impl Component for Looker {
    const NAME: &'static str = "Looker";
}

/// The entity's chat reaches others within `range`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Speaker {
    pub range: f32,
}

impl Component for Speaker {
    const NAME: &'static str = "Speaker";
}

/// Display name used in chat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Named {
    pub name: String,
}

impl Component for Named {
    const NAME: &'static str = "Named";
}

/// A note left in the world.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readable {
    pub text: String,
}

impl Component for Readable {
    const NAME: &'static str = "Readable";
}
