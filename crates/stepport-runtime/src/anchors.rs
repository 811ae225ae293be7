use bytes::{Bytes, BytesMut};
use stepport_core::{
    bytes_to_f32, AnchorLayout, DType, Error, IOName, ReductionPolicy, Result, Tensor, TensorInfo,
};

/// Host buffer for one anchor, overwritten in place every step.
#[derive(Debug)]
pub struct AnchorBuffer {
    layout: AnchorLayout,
    data: BytesMut,
}

impl AnchorBuffer {
    fn new(layout: AnchorLayout) -> Result<Self> {
        if layout.policy == ReductionPolicy::Sum
            && !matches!(layout.buffer.dtype(), DType::F32 | DType::I32 | DType::I64)
        {
            return Err(Error::InvalidConfiguration(format!(
                "SUM anchor `{}` is {}; only FLOAT, INT32 and INT64 can be summed",
                layout.name,
                layout.buffer.dtype()
            )));
        }
        let data = BytesMut::zeroed(layout.buffer.nbytes());
        Ok(Self { layout, data })
    }

    pub fn name(&self) -> &IOName {
        &self.layout.name
    }

    pub fn policy(&self) -> ReductionPolicy {
        self.layout.policy
    }

    pub fn info(&self) -> &TensorInfo {
        &self.layout.buffer
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Copies the buffer out; the copy survives the next step.
    pub fn to_tensor(&self) -> Tensor {
        Tensor {
            info: self.layout.buffer.clone(),
            data: Bytes::copy_from_slice(&self.data),
        }
    }

    pub fn to_f32(&self) -> anyhow::Result<Vec<f32>> {
        anyhow::ensure!(
            self.layout.buffer.dtype() == DType::F32,
            "anchor `{}` is {}",
            self.layout.name,
            self.layout.buffer
        );
        bytes_to_f32(&self.data)
    }

    fn fold(&mut self, micro_batch: usize, value: &Tensor) -> Result<()> {
        self.layout.micro_batch.validate(&self.layout.name, value)?;
        match self.layout.policy {
            ReductionPolicy::All => {
                let len = value.data.len();
                let at = micro_batch * len;
                self.data[at..at + len].copy_from_slice(&value.data);
            }
            ReductionPolicy::Final => self.data.copy_from_slice(&value.data),
            ReductionPolicy::Sum => {
                match self.layout.buffer.dtype() {
                    DType::F32 => sum_into::<4>(&mut self.data, &value.data, |a, b| {
                        (f32::from_le_bytes(a) + f32::from_le_bytes(b)).to_le_bytes()
                    }),
                    DType::I32 => sum_into::<4>(&mut self.data, &value.data, |a, b| {
                        i32::from_le_bytes(a).wrapping_add(i32::from_le_bytes(b)).to_le_bytes()
                    }),
                    DType::I64 => sum_into::<8>(&mut self.data, &value.data, |a, b| {
                        i64::from_le_bytes(a).wrapping_add(i64::from_le_bytes(b)).to_le_bytes()
                    }),
                    other => {
                        return Err(Error::InvalidConfiguration(format!(
                            "cannot sum {other} anchors"
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.data.fill(0);
    }

    fn has_non_finite(value: &Tensor) -> bool {
        value.dtype() == DType::F32
            && value
                .data
                .chunks_exact(4)
                .any(|b| !f32::from_le_bytes([b[0], b[1], b[2], b[3]]).is_finite())
    }
}

/// Adds `src` element-wise into `dst`, folding `src` onto `dst` in
/// contiguous groups when `src` is a whole multiple of `dst` long.
fn sum_into<const N: usize>(
    dst: &mut [u8],
    src: &[u8],
    add: impl Fn([u8; N], [u8; N]) -> [u8; N],
) {
    let dst_len = dst.len();
    for (i, chunk) in src.chunks_exact(N).enumerate() {
        let at = (i * N) % dst_len;
        let mut a = [0u8; N];
        let mut b = [0u8; N];
        a.copy_from_slice(&dst[at..at + N]);
        b.copy_from_slice(chunk);
        dst[at..at + N].copy_from_slice(&add(a, b));
    }
}

/// Every anchor buffer of a session, in registration order.
#[derive(Debug)]
pub struct AnchorBuffers {
    buffers: Vec<AnchorBuffer>,
}

impl AnchorBuffers {
    pub(crate) fn new(layouts: Vec<AnchorLayout>) -> Result<Self> {
        let buffers = layouts
            .into_iter()
            .map(AnchorBuffer::new)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { buffers })
    }

    pub fn get(&self, name: &IOName) -> Option<&AnchorBuffer> {
        self.buffers.iter().find(|b| b.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AnchorBuffer> {
        self.buffers.iter()
    }

    pub fn names(&self) -> Vec<IOName> {
        self.buffers.iter().map(|b| b.name().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Owned copies of every buffer.
    pub fn snapshot(&self) -> Vec<(IOName, Tensor)> {
        self.buffers
            .iter()
            .map(|b| (b.name().clone(), b.to_tensor()))
            .collect()
    }

    /// Resets the accumulating buffers before a new step.
    pub(crate) fn begin_step(&mut self) {
        for buffer in &mut self.buffers {
            if buffer.policy() == ReductionPolicy::Sum {
                buffer.clear();
            }
        }
    }

    /// Folds the value fetched for anchor `slot` in micro-batch `micro_batch`.
    pub(crate) fn fold(
        &mut self,
        slot: usize,
        micro_batch: usize,
        value: &Tensor,
        check_numerics: bool,
    ) -> Result<()> {
        let buffer = &mut self.buffers[slot];
        if check_numerics && AnchorBuffer::has_non_finite(value) {
            return Err(Error::Numerical(buffer.name().clone()));
        }
        buffer.fold(micro_batch, value)
    }
}

#[cfg(test)]
mod tests {
    use stepport_core::Shape;

    use super::*;

    fn layout(policy: ReductionPolicy, base: &[usize], buffer: &[usize]) -> AnchorLayout {
        AnchorLayout {
            name: IOName::from("a"),
            policy,
            micro_batch: TensorInfo::f32(base),
            buffer: TensorInfo::f32(buffer),
        }
    }

    fn value(dims: &[usize], values: &[f32]) -> Tensor {
        Tensor::from_f32(Shape::from_slice(dims), values)
    }

    #[test]
    fn all_writes_each_slot() {
        let mut buffers =
            AnchorBuffers::new(vec![layout(ReductionPolicy::All, &[2], &[6])]).unwrap();
        for mb in 0..3 {
            let v = mb as f32;
            buffers.fold(0, mb, &value(&[2], &[v, v + 0.5]), false).unwrap();
        }
        let got = buffers.get(&IOName::from("a")).unwrap().to_f32().unwrap();
        assert_eq!(got, vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5]);
    }

    #[test]
    fn sum_folds_groups_and_restarts_each_step() {
        let mut buffers =
            AnchorBuffers::new(vec![layout(ReductionPolicy::Sum, &[4], &[2])]).unwrap();
        for _ in 0..2 {
            buffers.begin_step();
            for mb in 0..2 {
                buffers
                    .fold(0, mb, &value(&[4], &[1.0, 2.0, 3.0, 4.0]), false)
                    .unwrap();
            }
        }
        let got = buffers.get(&IOName::from("a")).unwrap().to_f32().unwrap();
        assert_eq!(got, vec![8.0, 12.0]);
    }

    #[test]
    fn final_keeps_the_last_micro_batch() {
        let mut buffers =
            AnchorBuffers::new(vec![layout(ReductionPolicy::Final, &[], &[])]).unwrap();
        for mb in 0..3 {
            buffers.fold(0, mb, &value(&[], &[mb as f32]), false).unwrap();
        }
        assert_eq!(buffers.snapshot()[0].1.to_f32().unwrap(), vec![2.0]);
    }

    #[test]
    fn rejects_wrong_values_and_non_finite_data() {
        let mut buffers =
            AnchorBuffers::new(vec![layout(ReductionPolicy::Final, &[2], &[2])]).unwrap();
        let err = buffers.fold(0, 0, &value(&[3], &[0.0; 3]), false).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));

        let err = buffers
            .fold(0, 0, &value(&[2], &[1.0, f32::NAN]), true)
            .unwrap_err();
        assert!(matches!(err, Error::Numerical(_)));
        buffers.fold(0, 0, &value(&[2], &[1.0, f32::NAN]), false).unwrap();
    }

    #[test]
    fn summing_bytes_is_refused() {
        let layout = AnchorLayout {
            name: IOName::from("mask"),
            policy: ReductionPolicy::Sum,
            micro_batch: TensorInfo::new(DType::U8, Shape::from_slice(&[4])),
            buffer: TensorInfo::new(DType::U8, Shape::from_slice(&[2])),
        };
        assert!(AnchorBuffers::new(vec![layout]).is_err());
    }
}
