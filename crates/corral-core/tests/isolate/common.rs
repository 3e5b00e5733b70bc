use std::{cell::RefCell, collections::HashMap, rc::Rc, sync::Once};

use anyhow::{Context, Result};
use corral_core::{
    BufferId, Host, Isolate, IsolateConfig, Message, ModuleId, PrintLevel, Resolution, UserData,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub struct Received {
    pub user_data: UserData,
    pub control: Vec<u8>,
    pub zero_copy: Option<(BufferId, Vec<u8>)>,
}

#[derive(Debug, Default)]
pub struct HostLog {
    pub printed: Vec<(PrintLevel, String)>,
    pub received: Vec<Received>,
    /// Returned from the next `recv`, then cleared.
    pub reply: Option<Vec<u8>>,
}

/// Host that records everything guest code sends it.
#[derive(Clone, Default)]
pub struct RecordingHost {
    log: Rc<RefCell<HostLog>>,
}

impl RecordingHost {
    pub fn printed(&self) -> Vec<String> {
        self.log
            .borrow()
            .printed
            .iter()
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn printed_with_level(&self) -> Vec<(PrintLevel, String)> {
        self.log.borrow().printed.clone()
    }

    pub fn received(&self) -> Vec<Received> {
        self.log.borrow().received.clone()
    }

    pub fn reply_with(&self, bytes: Vec<u8>) {
        self.log.borrow_mut().reply = Some(bytes);
    }
}

impl Host for RecordingHost {
    fn recv(&mut self, user_data: UserData, message: Message<'_>) -> Option<Vec<u8>> {
        let mut log = self.log.borrow_mut();
        let zero_copy = message
            .zero_copy
            // SAFETY: the buffer was pinned for this call and no guest code runs
            // until we return.
            .map(|buf| (buf.id(), unsafe { buf.as_slice() }.to_vec()));
        log.received.push(Received {
            user_data,
            control: message.control.to_vec(),
            zero_copy,
        });
        log.reply.take()
    }

    fn print(&mut self, level: PrintLevel, message: &str) {
        self.log.borrow_mut().printed.push((level, message.to_owned()));
    }
}

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn isolate(host: &RecordingHost) -> Result<Isolate> {
    init_tracing();
    Isolate::new(IsolateConfig::new().host(host.clone())).context("failed to create isolate")
}

/// Register `main` and resolve its imports from `sources`, keyed by specifier.
pub fn load_graph(
    isolate: &mut Isolate,
    main: &str,
    sources: &[(&str, &str)],
) -> Result<ModuleId> {
    let sources: HashMap<&str, &str> = sources.iter().copied().collect();
    let main_source = sources
        .get(main)
        .with_context(|| format!("no source for {main}"))?;
    let id = isolate
        .register_module(true, main, main_source)
        .with_context(|| format!("failed to register {main}"))?;
    isolate
        .resolve_imports(&mut |_referrer: &str, specifier: &str| {
            sources
                .get(specifier)
                .map(|source| Resolution::Register {
                    name: specifier.to_owned(),
                    source: (*source).to_owned(),
                })
                .ok_or_else(|| format!("no module named {specifier}"))
        })
        .context("failed to resolve imports")?;
    Ok(id)
}
