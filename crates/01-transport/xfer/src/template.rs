//! Precompiled transfers.
//!
//! A template is built once for a fixed (source slot, destination slot)
//! pattern and restarted for every message that follows the pattern. The
//! manager owns the services the templates run on and bounds how many
//! templates are in flight at once.

use smallvec::SmallVec;
use tracing::{trace, warn};

use crate::request::{StartOutcome, XferRequest, XferServices, XferStatus};
use crate::{XferError, XferResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServicesId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateId(pub u32);

#[derive(Debug)]
struct TransferStep {
    services: ServicesId,
    request: XferRequest,
    started: bool,
    done: bool,
}

/// Ordered steps, each a request on one set of services. The final op of the
/// last step is expected to be the flag write.
#[derive(Debug, Default)]
pub struct TransferTemplate {
    steps: SmallVec<[TransferStep; 2]>,
    in_flight: bool,
    /// Length limit of the current instance, for steps started late.
    message_length: Option<u64>,
}

impl TransferTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_step(&mut self, services: ServicesId, request: XferRequest) {
        self.steps.push(TransferStep {
            services,
            request,
            started: false,
            done: false,
        });
    }

    pub fn with_step(mut self, services: ServicesId, request: XferRequest) -> Self {
        self.push_step(services, request);
        self
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn ends_with_flag(&self) -> bool {
        self.steps
            .last()
            .map(|step| step.request.ends_with_flag())
            .unwrap_or(false)
    }
}

pub struct TransferTemplateManager {
    services: Vec<Box<dyn XferServices>>,
    templates: Vec<TransferTemplate>,
    in_flight: usize,
    max_in_flight: usize,
    completed: Vec<TemplateId>,
}

impl TransferTemplateManager {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            services: Vec::new(),
            templates: Vec::new(),
            in_flight: 0,
            max_in_flight: max_in_flight.max(1),
            completed: Vec::new(),
        }
    }

    pub fn add_services(&mut self, services: Box<dyn XferServices>) -> ServicesId {
        self.services.push(services);
        ServicesId(self.services.len() as u32 - 1)
    }

    pub fn services(&self, id: ServicesId) -> XferResult<&dyn XferServices> {
        self.services
            .get(id.0 as usize)
            .map(|s| s.as_ref())
            .ok_or(XferError::Unsupported("unknown transfer services"))
    }

    pub fn add(&mut self, template: TransferTemplate) -> XferResult<TemplateId> {
        for step in &template.steps {
            self.services(step.services)?;
        }
        self.templates.push(template);
        Ok(TemplateId(self.templates.len() as u32 - 1))
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    fn template(&self, id: TemplateId) -> XferResult<&TransferTemplate> {
        self.templates
            .get(id.0 as usize)
            .ok_or(XferError::UnknownTemplate(id.0))
    }

    /// True when `id` could be started right now without a busy outcome.
    pub fn can_start(&self, id: TemplateId) -> XferResult<bool> {
        let template = self.template(id)?;
        if template.in_flight || self.in_flight >= self.max_in_flight {
            return Ok(false);
        }
        Ok(template
            .steps
            .iter()
            .all(|step| !self.services[step.services.0 as usize].is_busy()))
    }

    /// Starts every step of `id`. Nothing is started when the result is busy.
    ///
    /// A step whose driver turns busy after earlier steps were accepted is
    /// left for [`TransferTemplateManager::poll`] to start; the template
    /// counts as in flight from the first accepted step.
    pub fn start(&mut self, id: TemplateId, message_length: Option<u64>) -> XferResult<StartOutcome> {
        if !self.can_start(id)? {
            return Ok(StartOutcome::Busy);
        }
        let template = &mut self.templates[id.0 as usize];
        for step in template.steps.iter_mut() {
            step.started = false;
            step.done = false;
        }
        template.message_length = message_length;
        let started = match start_steps(&mut self.services, template) {
            Ok(started) => started,
            Err(err) => {
                if template.steps.iter().any(|step| step.started) {
                    template.in_flight = true;
                    self.in_flight += 1;
                }
                return Err(err);
            }
        };
        if started == 0 && !template.steps.is_empty() {
            trace!(template = id.0, "driver busy at start");
            return Ok(StartOutcome::Busy);
        }
        template.in_flight = true;
        self.in_flight += 1;
        trace!(template = id.0, ?message_length, started, "template started");
        Ok(StartOutcome::Started)
    }

    pub fn is_complete(&self, id: TemplateId) -> XferResult<bool> {
        Ok(!self.template(id)?.in_flight)
    }

    /// Advances in-flight templates; returns how many completed.
    ///
    /// A failed template is retired like a completed one, but not reported
    /// in [`TransferTemplateManager::drain_completed`]. Every template is
    /// polled before the first failure is returned.
    pub fn poll(&mut self) -> XferResult<usize> {
        let mut finished = 0;
        let mut failure = None;
        for (index, template) in self.templates.iter_mut().enumerate() {
            if !template.in_flight {
                continue;
            }
            match poll_steps(&mut self.services, template) {
                Ok(false) => continue,
                Ok(true) => {
                    self.completed.push(TemplateId(index as u32));
                    finished += 1;
                }
                Err(err) => {
                    warn!(template = index, %err, "transfer step failed");
                    failure.get_or_insert(err);
                }
            }
            template.in_flight = false;
            self.in_flight -= 1;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(finished),
        }
    }

    /// Templates that completed since the last call, in completion order.
    pub fn drain_completed(&mut self) -> Vec<TemplateId> {
        std::mem::take(&mut self.completed)
    }
}

/// Starts the template's unstarted steps in order, stopping at the first
/// busy driver. Returns how many steps are now started.
fn start_steps(services: &mut [Box<dyn XferServices>], template: &mut TransferTemplate) -> XferResult<usize> {
    let message_length = template.message_length;
    for step in template.steps.iter_mut().filter(|step| !step.started) {
        match services[step.services.0 as usize].start(&mut step.request, message_length)? {
            StartOutcome::Started => step.started = true,
            StartOutcome::Busy => break,
        }
    }
    Ok(template.steps.iter().filter(|step| step.started).count())
}

/// One status pass over a template. True once every step is done.
fn poll_steps(services: &mut [Box<dyn XferServices>], template: &mut TransferTemplate) -> XferResult<bool> {
    start_steps(services, template)?;
    let mut all_done = true;
    for step in template.steps.iter_mut().filter(|step| !step.done) {
        if !step.started {
            all_done = false;
            continue;
        }
        match services[step.services.0 as usize].status(&mut step.request)? {
            XferStatus::Done | XferStatus::Idle => step.done = true,
            XferStatus::Pending => all_done = false,
            XferStatus::Error => {
                return Err(XferError::transfer("transfer step failed"));
            }
        }
    }
    Ok(all_done)
}

impl Drop for TransferTemplateManager {
    fn drop(&mut self) {
        for template in self.templates.drain(..) {
            for step in template.steps {
                if let Some(services) = self.services.get_mut(step.services.0 as usize) {
                    services.release(step.request);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{XferFlags, XferOp};
    use crate::EndPoint;

    /// Services that finish a request after `latency` status polls and can be
    /// forced busy.
    struct ScriptedServices {
        endpoint: EndPoint,
        latency: u32,
        busy: bool,
        /// Starts to turn away while still claiming not to be busy.
        refusals: u32,
        failing: bool,
        polls: std::collections::HashMap<usize, u32>,
        starts: u32,
    }

    impl ScriptedServices {
        fn new(latency: u32) -> Self {
            Self {
                endpoint: EndPoint::new("test", "scripted", 64, 0, 1),
                latency,
                busy: false,
                refusals: 0,
                failing: false,
                polls: Default::default(),
                starts: 0,
            }
        }
    }

    impl XferServices for ScriptedServices {
        fn source(&self) -> &EndPoint {
            &self.endpoint
        }

        fn target(&self) -> &EndPoint {
            &self.endpoint
        }

        fn is_busy(&self) -> bool {
            self.busy
        }

        fn start(&mut self, request: &mut XferRequest, _len: Option<u64>) -> XferResult<StartOutcome> {
            if self.busy {
                return Ok(StartOutcome::Busy);
            }
            if self.refusals > 0 {
                self.refusals -= 1;
                return Ok(StartOutcome::Busy);
            }
            self.starts += 1;
            let key = request as *const XferRequest as usize;
            self.polls.insert(key, 0);
            request.set_status(XferStatus::Pending);
            Ok(StartOutcome::Started)
        }

        fn status(&mut self, request: &mut XferRequest) -> XferResult<XferStatus> {
            let key = request as *const XferRequest as usize;
            if self.failing {
                request.set_status(XferStatus::Error);
                return Ok(XferStatus::Error);
            }
            let polls = self.polls.entry(key).or_insert(0);
            *polls += 1;
            if *polls >= self.latency {
                request.set_status(XferStatus::Done);
            }
            Ok(request.status())
        }
    }

    fn flag_request() -> XferRequest {
        XferRequest::new(XferOp {
            src_offset: 0,
            dst_offset: 0,
            length: 8,
            flags: XferFlags::FLAG,
            message_offset: 0,
        })
    }

    #[test]
    fn template_cannot_restart_until_complete() {
        let mut manager = TransferTemplateManager::new(4);
        let services = manager.add_services(Box::new(ScriptedServices::new(2)));
        let id = manager
            .add(TransferTemplate::new().with_step(services, flag_request()))
            .expect("add");

        assert_eq!(manager.start(id, None).expect("start"), StartOutcome::Started);
        assert_eq!(manager.start(id, None).expect("restart"), StartOutcome::Busy);
        assert!(!manager.is_complete(id).expect("state"));

        assert_eq!(manager.poll().expect("poll"), 0);
        assert_eq!(manager.poll().expect("poll"), 1);
        assert!(manager.is_complete(id).expect("state"));
        assert_eq!(manager.drain_completed(), vec![id]);
        assert_eq!(manager.start(id, None).expect("start"), StartOutcome::Started);
    }

    #[test]
    fn in_flight_templates_are_bounded() {
        let mut manager = TransferTemplateManager::new(2);
        let services = manager.add_services(Box::new(ScriptedServices::new(1)));
        let ids: Vec<_> = (0..3)
            .map(|_| {
                manager
                    .add(TransferTemplate::new().with_step(services, flag_request()))
                    .expect("add")
            })
            .collect();

        assert_eq!(manager.start(ids[0], None).expect("start"), StartOutcome::Started);
        assert_eq!(manager.start(ids[1], None).expect("start"), StartOutcome::Started);
        assert_eq!(manager.start(ids[2], None).expect("start"), StartOutcome::Busy);
        assert_eq!(manager.in_flight(), 2);

        assert_eq!(manager.poll().expect("poll"), 2);
        assert_eq!(manager.start(ids[2], None).expect("start"), StartOutcome::Started);
    }

    #[test]
    fn busy_services_start_nothing() {
        let mut manager = TransferTemplateManager::new(4);
        let idle = manager.add_services(Box::new(ScriptedServices::new(1)));
        let mut busy = ScriptedServices::new(1);
        busy.busy = true;
        let busy = manager.add_services(Box::new(busy));
        let id = manager
            .add(
                TransferTemplate::new()
                    .with_step(idle, flag_request())
                    .with_step(busy, flag_request()),
            )
            .expect("add");

        assert_eq!(manager.start(id, None).expect("start"), StartOutcome::Busy);
        assert_eq!(manager.in_flight(), 0);
        assert!(manager.is_complete(id).expect("state"));
    }

    #[test]
    fn late_busy_on_the_first_step_is_not_an_error() {
        let mut manager = TransferTemplateManager::new(4);
        let mut refusing = ScriptedServices::new(1);
        refusing.refusals = 1;
        let services = manager.add_services(Box::new(refusing));
        let id = manager
            .add(TransferTemplate::new().with_step(services, flag_request()))
            .expect("add");

        assert!(manager.can_start(id).expect("can start"));
        assert_eq!(manager.start(id, None).expect("start"), StartOutcome::Busy);
        assert_eq!(manager.in_flight(), 0);
        assert!(manager.is_complete(id).expect("state"));

        assert_eq!(manager.start(id, None).expect("retry"), StartOutcome::Started);
        assert_eq!(manager.poll().expect("poll"), 1);
        assert_eq!(manager.drain_completed(), vec![id]);
    }

    #[test]
    fn steps_refused_mid_template_start_on_a_later_poll() {
        let mut manager = TransferTemplateManager::new(4);
        let first = manager.add_services(Box::new(ScriptedServices::new(1)));
        let mut refusing = ScriptedServices::new(1);
        refusing.refusals = 2;
        let second = manager.add_services(Box::new(refusing));
        let id = manager
            .add(
                TransferTemplate::new()
                    .with_step(first, flag_request())
                    .with_step(second, flag_request()),
            )
            .expect("add");

        assert_eq!(manager.start(id, Some(4)).expect("start"), StartOutcome::Started);
        assert_eq!(manager.in_flight(), 1);
        assert_eq!(manager.start(id, None).expect("restart"), StartOutcome::Busy);

        // Second step is refused once more, then starts and completes.
        assert_eq!(manager.poll().expect("poll"), 0);
        assert_eq!(manager.poll().expect("poll"), 1);
        assert_eq!(manager.in_flight(), 0);
        assert_eq!(manager.drain_completed(), vec![id]);
    }

    #[test]
    fn failed_templates_are_retired_and_the_rest_still_complete() {
        let mut manager = TransferTemplateManager::new(4);
        let mut broken = ScriptedServices::new(1);
        broken.failing = true;
        let broken = manager.add_services(Box::new(broken));
        let healthy = manager.add_services(Box::new(ScriptedServices::new(1)));
        let failing = manager
            .add(TransferTemplate::new().with_step(broken, flag_request()))
            .expect("add");
        let finishing = manager
            .add(TransferTemplate::new().with_step(healthy, flag_request()))
            .expect("add");

        assert_eq!(manager.start(failing, None).expect("start"), StartOutcome::Started);
        assert_eq!(manager.start(finishing, None).expect("start"), StartOutcome::Started);
        assert!(matches!(manager.poll(), Err(XferError::Transfer(_))));

        assert_eq!(manager.in_flight(), 0);
        assert!(manager.is_complete(failing).expect("state"));
        assert_eq!(manager.drain_completed(), vec![finishing]);
        assert_eq!(manager.poll().expect("quiet"), 0);
    }

    #[test]
    fn unknown_ids_are_rejected() {
        let mut manager = TransferTemplateManager::new(1);
        assert!(matches!(
            manager.start(TemplateId(3), None),
            Err(XferError::UnknownTemplate(3))
        ));
        assert!(manager
            .add(TransferTemplate::new().with_step(ServicesId(0), flag_request()))
            .is_err());
    }
}
