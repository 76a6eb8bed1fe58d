// Copyright 2025 Irreducible Inc.

use bytes::{Buf, BufMut};

#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
	#[error("Write buffer is full")]
	WriteBufferFull,
	#[error("Not enough data in read buffer to deserialize")]
	NotEnoughBytes,
	#[error("Unknown enum variant index {name}::{index}")]
	UnknownEnumVariant { name: &'static str, index: u8 },
	#[error("FromUtf8Error: {0}")]
	FromUtf8Error(#[from] std::string::FromUtf8Error),
	#[error("Length {0} does not fit into usize")]
	LengthOverflow(u64),
	#[error("Invalid data: {0}")]
	InvalidData(String),
}

/// Represents type that can be serialized to a byte buffer.
pub trait SerializeBytes {
	fn serialize(&self, write_buf: impl BufMut) -> Result<(), Error>;
}

/// Represents type that can be deserialized from a byte buffer.
pub trait DeserializeBytes {
	fn deserialize(read_buf: impl Buf) -> Result<Self, Error>
	where
		Self: Sized;
}

fn ensure_writable(write_buf: &impl BufMut, n: usize) -> Result<(), Error> {
	if write_buf.remaining_mut() < n {
		return Err(Error::WriteBufferFull);
	}
	Ok(())
}

fn ensure_readable(read_buf: &impl Buf, n: usize) -> Result<(), Error> {
	if read_buf.remaining() < n {
		return Err(Error::NotEnoughBytes);
	}
	Ok(())
}

macro_rules! impl_serialize_le {
	($ty:ty, $put:ident, $get:ident) => {
		impl SerializeBytes for $ty {
			fn serialize(&self, mut write_buf: impl BufMut) -> Result<(), Error> {
				ensure_writable(&write_buf, std::mem::size_of::<$ty>())?;
				write_buf.$put(*self);
				Ok(())
			}
		}

		impl DeserializeBytes for $ty {
			fn deserialize(mut read_buf: impl Buf) -> Result<Self, Error> {
				ensure_readable(&read_buf, std::mem::size_of::<$ty>())?;
				Ok(read_buf.$get())
			}
		}
	};
}

impl_serialize_le!(u8, put_u8, get_u8);
impl_serialize_le!(u32, put_u32_le, get_u32_le);
impl_serialize_le!(u64, put_u64_le, get_u64_le);
impl_serialize_le!(f32, put_f32_le, get_f32_le);
impl_serialize_le!(f64, put_f64_le, get_f64_le);

impl SerializeBytes for usize {
	fn serialize(&self, write_buf: impl BufMut) -> Result<(), Error> {
		(*self as u64).serialize(write_buf)
	}
}

impl DeserializeBytes for usize {
	fn deserialize(read_buf: impl Buf) -> Result<Self, Error> {
		let value = u64::deserialize(read_buf)?;
		usize::try_from(value).map_err(|_| Error::LengthOverflow(value))
	}
}

impl SerializeBytes for bool {
	fn serialize(&self, write_buf: impl BufMut) -> Result<(), Error> {
		u8::from(*self).serialize(write_buf)
	}
}

impl DeserializeBytes for bool {
	fn deserialize(read_buf: impl Buf) -> Result<Self, Error> {
		match u8::deserialize(read_buf)? {
			0 => Ok(false),
			1 => Ok(true),
			index => Err(Error::UnknownEnumVariant {
				name: "bool",
				index,
			}),
		}
	}
}

impl SerializeBytes for String {
	fn serialize(&self, mut write_buf: impl BufMut) -> Result<(), Error> {
		self.len().serialize(&mut write_buf)?;
		ensure_writable(&write_buf, self.len())?;
		write_buf.put_slice(self.as_bytes());
		Ok(())
	}
}

impl DeserializeBytes for String {
	fn deserialize(mut read_buf: impl Buf) -> Result<Self, Error> {
		let len = usize::deserialize(&mut read_buf)?;
		ensure_readable(&read_buf, len)?;
		let mut bytes = vec![0u8; len];
		read_buf.copy_to_slice(&mut bytes);
		Ok(String::from_utf8(bytes)?)
	}
}

impl<T: SerializeBytes> SerializeBytes for Vec<T> {
	fn serialize(&self, mut write_buf: impl BufMut) -> Result<(), Error> {
		self.len().serialize(&mut write_buf)?;
		for item in self {
			item.serialize(&mut write_buf)?;
		}
		Ok(())
	}
}

impl<T: DeserializeBytes> DeserializeBytes for Vec<T> {
	fn deserialize(mut read_buf: impl Buf) -> Result<Self, Error> {
		let len = usize::deserialize(&mut read_buf)?;
		// A corrupt length must not trigger a huge allocation up front.
		let mut items = Vec::with_capacity(len.min(read_buf.remaining()));
		for _ in 0..len {
			items.push(T::deserialize(&mut read_buf)?);
		}
		Ok(items)
	}
}
