//! Startup blobs.
//!
//! Two independent blobs bootstrap an isolate: *natives* (built-in library
//! modules, checked by the engine when the blob is built) and a *snapshot*
//! (application modules, their links, and the entry modules to run so the
//! context comes up warm). Both share one container:
//!
//! ```text
//! magic "CRRL" | kind u8 | format version u16 LE | sha256(payload) | CBOR payload
//! ```
//!
//! The payload records the engine it was built for. A payload is only ever
//! replayed when its checksum and engine tag match.

use core::convert::Infallible;
use std::{collections::HashSet, sync::OnceLock};

use bytes::{Buf, BufMut, BytesMut};
use rquickjs::{Context, Runtime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::{Error, Result},
    exception::ExceptionInfo,
    imports,
    module::{
        ModuleId, ModuleMap,
        loader::{EngineModules, LinkResolver, ModuleLoader},
    },
};

pub const MAGIC: &[u8; 4] = b"CRRL";
pub const FORMAT_VERSION: u16 = 1;

/// Module semantics follow the engine release; bump with `rquickjs`.
const ENGINE: &str = "quickjs/rquickjs-0.9";

const HEADER_LEN: usize = MAGIC.len() + 1 + 2 + 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlobKind {
    Natives = 1,
    Snapshot = 2,
}

impl BlobKind {
    const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Natives),
            2 => Some(Self::Snapshot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Image {
    pub(crate) engine: String,
    pub(crate) modules: Vec<ImageModule>,
    /// Entry modules in the order they were evaluated.
    pub(crate) entries: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ImageModule {
    pub(crate) name: String,
    pub(crate) main: bool,
    pub(crate) imports: Vec<ImageImport>,
    pub(crate) source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ImageImport {
    pub(crate) specifier: String,
    /// Name of the linked module, if the import was resolved when recorded.
    pub(crate) target: Option<String>,
}

struct BlobWriter(BytesMut);

impl minicbor::encode::Write for BlobWriter {
    type Error = Infallible;

    fn write_all(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        self.0.extend_from_slice(buf);
        Ok(())
    }
}

impl Image {
    fn empty() -> Self {
        Self {
            engine: ENGINE.to_owned(),
            modules: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub(crate) fn encode(&self, kind: BlobKind) -> Result<Vec<u8>> {
        let mut writer = BytesMut::with_capacity(HEADER_LEN);
        writer.put_slice(MAGIC);
        writer.put_u8(kind as u8);
        writer.put_u16_le(FORMAT_VERSION);
        writer.put_bytes(0, 32);

        let mut serializer = minicbor_serde::Serializer::new(BlobWriter(writer));
        self.serialize(&mut serializer).map_err(Error::bootstrap)?;
        let mut blob = serializer.into_encoder().into_writer().0;

        let digest = Sha256::digest(&blob[HEADER_LEN..]);
        blob[HEADER_LEN - 32..HEADER_LEN].copy_from_slice(&digest);
        Ok(blob.to_vec())
    }

    pub(crate) fn decode(kind: BlobKind, blob: &[u8]) -> Result<Self> {
        if blob.len() < HEADER_LEN {
            return Err(Error::Bootstrap(format!(
                "{kind:?} blob is truncated ({} bytes)",
                blob.len()
            )));
        }
        let (mut header, payload) = blob.split_at(HEADER_LEN);

        if &header[..MAGIC.len()] != MAGIC {
            return Err(Error::Bootstrap(format!("{kind:?} blob has bad magic")));
        }
        header.advance(MAGIC.len());

        let raw_kind = header.get_u8();
        if BlobKind::from_u8(raw_kind) != Some(kind) {
            return Err(Error::Bootstrap(format!(
                "expected a {kind:?} blob, found kind {raw_kind}"
            )));
        }
        let version = header.get_u16_le();
        if version != FORMAT_VERSION {
            return Err(Error::Bootstrap(format!(
                "{kind:?} blob has format version {version}, expected {FORMAT_VERSION}"
            )));
        }
        if Sha256::digest(payload).as_slice() != header {
            return Err(Error::Bootstrap(format!("{kind:?} blob checksum mismatch")));
        }

        let mut deserializer = minicbor_serde::Deserializer::new(payload);
        let image = Self::deserialize(&mut deserializer).map_err(Error::bootstrap)?;
        if image.engine != ENGINE {
            return Err(Error::Bootstrap(format!(
                "{kind:?} blob was built for `{}`, this build runs `{ENGINE}`",
                image.engine
            )));
        }
        Ok(image)
    }
}

/// A validated natives/snapshot pair.
#[derive(Debug, Clone)]
pub struct StartupData {
    pub(crate) natives: Image,
    pub(crate) snapshot: Image,
}

impl StartupData {
    /// # Errors
    /// Returns [`Error::Bootstrap`] if either blob is corrupt or was built for
    /// another engine or format version.
    pub fn new(natives: &[u8], snapshot: &[u8]) -> Result<Self> {
        Ok(Self {
            natives: Image::decode(BlobKind::Natives, natives)?,
            snapshot: Image::decode(BlobKind::Snapshot, snapshot)?,
        })
    }
}

static STARTUP: OnceLock<StartupData> = OnceLock::new();

/// Install the process-wide startup data used by
/// [`crate::Isolate::from_startup_data`]. It can be installed once.
///
/// # Errors
/// Returns [`Error::State`] if startup data is already installed.
pub fn install_startup_data(data: StartupData) -> Result<()> {
    STARTUP
        .set(data)
        .map_err(|_| Error::State("startup data is already installed"))?;
    tracing::debug!("startup data installed");
    Ok(())
}

pub(crate) fn startup_data() -> Option<&'static StartupData> {
    STARTUP.get()
}

/// Check built-in library modules and pack them into a natives blob.
///
/// Natives may only import each other, by exact name. Every module is
/// compiled by the engine once here so that a blob never carries code the
/// engine rejects.
///
/// # Errors
/// Returns [`Error::Syntax`] for a module that does not compile and
/// [`Error::Resolution`] for an import that names no other native.
pub fn compile_natives<N, S>(sources: &[(N, S)]) -> Result<Vec<u8>>
where
    N: AsRef<str>,
    S: AsRef<str>,
{
    let names: HashSet<&str> = sources.iter().map(|(name, _)| name.as_ref()).collect();
    let engine = EngineModules::default();

    let mut image = Image::empty();
    for (name, source) in sources {
        let (name, source) = (name.as_ref(), source.as_ref());
        let syntax = imports::extract(name, source)?;
        let imports = syntax
            .specifiers
            .into_iter()
            .map(|specifier| {
                if names.contains(specifier.as_str()) {
                    engine.link(name, &specifier, &specifier);
                    Ok(ImageImport {
                        target: Some(specifier.clone()),
                        specifier,
                    })
                } else {
                    Err(Error::Resolution {
                        referrer: name.to_owned(),
                        specifier,
                        reason: "natives can only import other natives".to_owned(),
                    })
                }
            })
            .collect::<Result<Vec<_>>>()?;
        engine.add(name, source);
        image.modules.push(ImageModule {
            name: name.to_owned(),
            main: false,
            imports,
            source: source.to_owned(),
        });
    }

    let runtime = Runtime::new()?;
    runtime.set_loader(LinkResolver(engine.clone()), ModuleLoader(engine.clone()));
    let context = Context::full(&runtime)?;
    for module in &image.modules {
        if engine.is_declared(&module.name) {
            continue;
        }
        context.with(|ctx| {
            engine
                .declare(&ctx, &module.name)
                .map(drop)
                .map_err(|err| match err {
                    rquickjs::Error::Exception => Error::Syntax {
                        name: module.name.clone(),
                        message: ExceptionInfo::catch(&ctx).to_string(),
                    },
                    other => Error::Engine(other),
                })
        })?;
    }

    tracing::debug!(modules = image.modules.len(), "natives compiled");
    image.encode(BlobKind::Natives)
}

/// Recorder kept by an isolate created with `will_snapshot`.
#[derive(Default)]
pub(crate) struct SnapshotCreator {
    entries: Vec<ModuleId>,
}

impl SnapshotCreator {
    pub(crate) fn record_entry(&mut self, id: ModuleId) {
        if !self.entries.contains(&id) {
            self.entries.push(id);
        }
    }

    /// Serialize every non-builtin module still registered, with its links,
    /// and the entries evaluated so far.
    pub(crate) fn finish(self, modules: &ModuleMap<String>) -> Result<Vec<u8>> {
        let mut image = Image::empty();
        for (_, info) in modules.iter().filter(|(_, info)| !info.builtin) {
            let imports = info
                .imports
                .iter()
                .zip(&info.links)
                .map(|(specifier, link)| ImageImport {
                    specifier: specifier.clone(),
                    target: link
                        .and_then(|target| modules.get(target).ok())
                        .map(|target| target.name.clone()),
                })
                .collect();
            image.modules.push(ImageModule {
                name: info.name.clone(),
                main: info.main,
                imports,
                source: info.code.clone(),
            });
        }
        image.entries = self
            .entries
            .iter()
            .filter_map(|id| modules.get(*id).ok())
            .map(|info| info.name.clone())
            .collect();

        tracing::debug!(
            modules = image.modules.len(),
            entries = image.entries.len(),
            "snapshot created"
        );
        image.encode(BlobKind::Snapshot)
    }
}
