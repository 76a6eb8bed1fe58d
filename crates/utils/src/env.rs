// Copyright 2025 Irreducible Inc.

/// Name of the flag that forces every computation onto the host path.
pub const HOST_ONLY_ENV: &str = "LUTNET_HOST_ONLY";

fn parse_flag(value: &str) -> Option<bool> {
	match value {
		"1" | "on" | "ON" | "true" | "TRUE" | "yes" | "YES" => Some(true),
		"0" | "off" | "OFF" | "false" | "FALSE" | "no" | "NO" => Some(false),
		_ => None,
	}
}

/// Read boolean flag from the environment variable.
pub fn boolean_env_flag_set(flag: &str) -> bool {
	std::env::var(flag)
		.ok()
		.and_then(|val| parse_flag(&val))
		.unwrap_or(false)
}

/// Parses the textual boolean forms accepted by environment flags and string commands.
pub fn parse_bool(value: &str) -> Option<bool> {
	parse_flag(value.trim())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_bool() {
		assert_eq!(parse_bool("true"), Some(true));
		assert_eq!(parse_bool(" off "), Some(false));
		assert_eq!(parse_bool("maybe"), None);
	}

	#[test]
	fn test_unset_flag_is_false() {
		assert!(!boolean_env_flag_set("LUTNET_TEST_FLAG_THAT_IS_NEVER_SET"));
	}
}
