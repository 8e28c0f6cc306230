use crate::http::{HeaderName, HeaderValue};
use crate::policy::{
	HeaderMode, HeaderMutations, Policy, PolicyContext, PolicyError, ProcessingMode, RequestAction,
	RequestModifications, ResponseAction, ResponseModifications,
};
use crate::*;

#[apply(schema_de!)]
#[derive(Default, Copy, PartialEq, Eq)]
pub enum PhaseTarget {
	#[default]
	Request,
	Response,
}

#[apply(schema_de!)]
pub struct HeaderListSerde {
	#[serde_as(as = "serde_with::Map<_, _>")]
	pub headers: Vec<(Strng, Strng)>,
	#[serde(default)]
	pub target: PhaseTarget,
}

#[apply(schema_de!)]
pub struct RemoveHeadersSerde {
	pub headers: Vec<Strng>,
	#[serde(default)]
	pub target: PhaseTarget,
}

#[apply(schema_de!)]
pub struct ModifyHeadersSerde {
	pub entries: Vec<ModifyEntry>,
	#[serde(default)]
	pub target: PhaseTarget,
}

#[apply(schema_de!)]
pub struct ModifyEntry {
	pub action: ModifyAction,
	pub name: Strng,
	#[serde(default)]
	pub value: Option<Strng>,
}

#[apply(schema_de!)]
#[derive(Copy, PartialEq, Eq)]
pub enum ModifyAction {
	#[serde(rename = "SET")]
	Set,
	#[serde(rename = "DELETE")]
	Delete,
}

fn parse_pairs(pairs: &[(Strng, Strng)]) -> anyhow::Result<Vec<(HeaderName, HeaderValue)>> {
	pairs
		.iter()
		.map(|(k, v)| {
			Ok((
				HeaderName::from_bytes(k.as_bytes()).with_context(|| format!("invalid header name {k:?}"))?,
				HeaderValue::from_str(v).with_context(|| format!("invalid header value for {k:?}"))?,
			))
		})
		.collect()
}

/// The four header policies share one engine; they differ only in which
/// mutation list their configuration populates.
pub struct HeaderPolicy {
	name: Strng,
	target: PhaseTarget,
	mutations: HeaderMutations,
}

impl HeaderPolicy {
	/// Append semantics; existing values are preserved.
	pub fn add(config: HeaderListSerde) -> anyhow::Result<Self> {
		let mut m = HeaderMutations::default();
		m.add = parse_pairs(&config.headers)?;
		Ok(HeaderPolicy {
			name: strng::literal!("add-headers"),
			target: config.target,
			mutations: m,
		})
	}

	/// Replace semantics; the last duplicate in the configuration wins.
	pub fn set(config: HeaderListSerde) -> anyhow::Result<Self> {
		let mut m = HeaderMutations::default();
		m.set = parse_pairs(&config.headers)?;
		Ok(HeaderPolicy {
			name: strng::literal!("set-headers"),
			target: config.target,
			mutations: m,
		})
	}

	/// Case-insensitive removal; absent names are a no-op.
	pub fn remove(config: RemoveHeadersSerde) -> anyhow::Result<Self> {
		let mut m = HeaderMutations::default();
		m.remove = config
			.headers
			.iter()
			.map(|k| {
				HeaderName::from_bytes(k.as_bytes()).with_context(|| format!("invalid header name {k:?}"))
			})
			.collect::<anyhow::Result<_>>()?;
		Ok(HeaderPolicy {
			name: strng::literal!("remove-headers"),
			target: config.target,
			mutations: m,
		})
	}

	/// SET/DELETE entries applied in declared order.
	pub fn modify(config: ModifyHeadersSerde) -> anyhow::Result<Self> {
		let mut m = HeaderMutations::default();
		for e in &config.entries {
			let name = HeaderName::from_bytes(e.name.as_bytes())
				.with_context(|| format!("invalid header name {:?}", e.name))?;
			match e.action {
				ModifyAction::Set => {
					let value = e
						.value
						.as_ref()
						.ok_or_else(|| anyhow::anyhow!("SET entry for {:?} requires a value", e.name))?;
					m.set.push((name, HeaderValue::from_str(value)?));
				},
				ModifyAction::Delete => m.remove.push(name),
			}
		}
		Ok(HeaderPolicy {
			name: strng::literal!("modify-headers"),
			target: config.target,
			mutations: m,
		})
	}
}

#[async_trait::async_trait]
impl Policy for HeaderPolicy {
	fn name(&self) -> Strng {
		self.name.clone()
	}

	fn mode(&self) -> ProcessingMode {
		match self.target {
			PhaseTarget::Request => ProcessingMode::request_only(),
			PhaseTarget::Response => ProcessingMode {
				response_header: HeaderMode::Process,
				..ProcessingMode::passthrough()
			},
		}
	}

	async fn on_request(&self, _ctx: &mut PolicyContext<'_>) -> Result<RequestAction, PolicyError> {
		if self.target != PhaseTarget::Request {
			return Ok(RequestAction::pass());
		}
		Ok(RequestAction::Modify(RequestModifications {
			headers: self.mutations.clone(),
			..Default::default()
		}))
	}

	async fn on_response(&self, _ctx: &mut PolicyContext<'_>) -> Result<ResponseAction, PolicyError> {
		if self.target != PhaseTarget::Response {
			return Ok(ResponseAction::pass());
		}
		Ok(ResponseAction::Modify(ResponseModifications {
			headers: self.mutations.clone(),
			..Default::default()
		}))
	}
}
