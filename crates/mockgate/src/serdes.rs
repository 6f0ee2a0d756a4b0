use std::fmt::Display;

use serde::{Deserialize, Deserializer, Serializer};

/// Serde yaml represents things differently than just "JSON in YAML format".
/// We don't want this. Instead, we transcode YAML via the JSON module.
pub mod yamlviajson {
	use serde::{de, ser};

	pub fn from_str<T>(s: &str) -> anyhow::Result<T>
	where
		T: for<'de> de::Deserialize<'de>,
	{
		let de_yaml = serde_yaml::Deserializer::from_str(s);
		let mut buf = Vec::with_capacity(128);
		{
			let mut se_json = serde_json::Serializer::new(&mut buf);
			serde_transcode::transcode(de_yaml, &mut se_json)?;
		}
		let mut de_json = serde_json::Deserializer::from_slice(&buf);
		Ok(serde_path_to_error::deserialize(&mut de_json)?)
	}

	pub fn to_string<T>(value: &T) -> anyhow::Result<String>
	where
		T: ?Sized + ser::Serialize,
	{
		let js = serde_json::to_string(value)?;
		let mut buf = Vec::with_capacity(128);
		let mut se_yaml = serde_yaml::Serializer::new(&mut buf);
		let mut de_json = serde_json::Deserializer::from_str(&js);
		serde_transcode::transcode(&mut de_json, &mut se_yaml)?;
		Ok(String::from_utf8(buf)?)
	}
}

pub fn is_default<T: Default + PartialEq>(t: &T) -> bool {
	*t == Default::default()
}

pub mod serde_dur {
	use duration_str::HumanFormat;
	pub use duration_str::deserialize_duration as deserialize;
	use serde::Serializer;

	pub fn serialize<S: Serializer, T: HumanFormat>(t: &T, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&t.human_format())
	}
}

pub mod serde_dur_option {
	use duration_str::HumanFormat;
	pub use duration_str::deserialize_option_duration as deserialize;
	use serde::Serializer;

	pub fn serialize<S: Serializer, T: HumanFormat>(
		t: &Option<T>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		match t {
			None => serializer.serialize_none(),
			Some(t) => serializer.serialize_str(&t.human_format()),
		}
	}
}

pub mod serde_b64 {
	use base64::Engine;
	use base64::engine::general_purpose::STANDARD;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(t: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&STANDARD.encode(t))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
		let s = String::deserialize(deserializer)?;
		STANDARD.decode(s).map_err(serde::de::Error::custom)
	}
}

pub mod serde_b64_option {
	use base64::Engine;
	use base64::engine::general_purpose::STANDARD;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(t: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
		match t {
			None => serializer.serialize_none(),
			Some(t) => serializer.serialize_str(&STANDARD.encode(t)),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(
		deserializer: D,
	) -> Result<Option<Vec<u8>>, D::Error> {
		let s: Option<String> = Option::deserialize(deserializer)?;
		match s {
			None => Ok(None),
			Some(s) => STANDARD.decode(s).map(Some).map_err(serde::de::Error::custom),
		}
	}
}

pub fn ser_display<S: Serializer, T: Display>(t: &T, serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_str(&t.to_string())
}

pub fn de_parse<'de: 'a, 'a, D, T>(deserializer: D) -> Result<T, D::Error>
where
	D: Deserializer<'de>,
	T: TryFrom<&'a str>,
	<T as TryFrom<&'a str>>::Error: Display,
{
	let s: &'a str = <&str>::deserialize(deserializer)?;
	match T::try_from(s) {
		Ok(t) => Ok(t),
		Err(e) => Err(serde::de::Error::custom(e)),
	}
}
