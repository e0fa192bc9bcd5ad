use crate::error::Result;
use crate::meta::Meta;
use crate::scheduler::job::Job;

/// Typed job queue operations over the queue currently selected on a [`Meta`].
///
/// Every call runs inside the caller's transaction, so a handler's schema
/// mutation and the job bookkeeping commit or abort together.
pub struct JobQueue<'m, 'a> {
    meta: &'m mut Meta<'a>,
}

impl<'m, 'a> JobQueue<'m, 'a> {
    pub fn new(meta: &'m mut Meta<'a>) -> Self {
        Self { meta }
    }

    /// Appends a job at the tail. The job's ID must already be assigned.
    pub fn enqueue(&mut self, job: &mut Job) -> Result<()> {
        let bytes = job.encode(true)?;
        self.meta.queue_push(bytes)
    }

    /// Returns the job at the head without removing it.
    pub fn peek_head(&self) -> Result<Option<Job>> {
        self.get(0)
    }

    pub fn get(&self, index: usize) -> Result<Option<Job>> {
        match self.meta.queue_index(index) {
            Some(bytes) => Ok(Some(Job::decode(bytes)?)),
            None => Ok(None),
        }
    }

    /// Overwrites the head entry.
    ///
    /// Raw args are only replaced by the typed form when `update_raw_args`
    /// is set, so a job whose args never decoded keeps its original bytes.
    pub fn update_head(&mut self, job: &mut Job, update_raw_args: bool) -> Result<()> {
        self.update(0, job, update_raw_args)
    }

    pub fn update(&mut self, index: usize, job: &mut Job, update_raw_args: bool) -> Result<()> {
        let bytes = job.encode(update_raw_args)?;
        self.meta.queue_set(index, bytes)
    }

    /// Removes and returns the head entry.
    pub fn dequeue_head(&mut self) -> Result<Option<Job>> {
        match self.meta.queue_pop() {
            Some(bytes) => Ok(Some(Job::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All queued jobs, head first.
    pub fn all(&self) -> Result<Vec<Job>> {
        self.meta
            .queue_all()
            .into_iter()
            .map(Job::decode)
            .collect()
    }

    /// Position and contents of the job with `id`, if queued.
    pub fn find(&self, id: i64) -> Result<Option<(usize, Job)>> {
        Ok(self
            .all()?
            .into_iter()
            .enumerate()
            .find(|(_, job)| job.id == id))
    }

    pub fn len(&self) -> usize {
        self.meta.queue_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
