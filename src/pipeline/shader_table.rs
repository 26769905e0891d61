use crate::device::{
    align_up, BufferId, Capabilities, Device, GpuAddress, GpuRange, GpuStridedRange,
    StateObjectId,
};
use crate::{ContractViolation, Error, Result};

/// Host-written array of shader records, one identifier per record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShaderTable {
    buffer: BufferId,
    address: GpuAddress,
    stride: u64,
    count: u64,
}

/// Identifier size rounded up to the shader-record alignment.
pub fn record_stride(caps: &Capabilities) -> u64 {
    align_up(
        u64::from(caps.shader_identifier_size),
        u64::from(caps.shader_record_alignment),
    )
}

impl ShaderTable {
    /// Packs the identifiers of `exports` (in order) into a new upload
    /// buffer.
    pub fn build<D, S>(
        device: &mut D,
        label: &'static str,
        state_object: StateObjectId,
        exports: &[S],
    ) -> Result<Self>
    where
        D: Device + ?Sized,
        S: AsRef<str>,
    {
        if exports.is_empty() {
            return Err(ContractViolation::EmptyShaderTable(label).into());
        }

        let caps = device.capabilities();
        let stride = record_stride(&caps);
        let mut records = vec![0u8; (stride as usize) * exports.len()];

        for (record, export) in records.chunks_exact_mut(stride as usize).zip(exports) {
            let export = export.as_ref();
            let identifier = device
                .shader_identifier(state_object, export)
                .ok_or_else(|| Error::MissingShaderIdentifier(export.to_owned()))?;

            record[..identifier.0.len()].copy_from_slice(&identifier.0);
        }

        let buffer = device.create_upload_buffer(&format!("{label} shader table"), &records)?;
        let address = device.buffer_address(buffer);

        debug_assert_eq!(0, address % u64::from(caps.shader_table_alignment));

        Ok(Self {
            buffer,
            address,
            stride,
            count: exports.len() as u64,
        })
    }

    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn size(&self) -> u64 {
        self.stride * self.count
    }

    /// Range of the first record; ray generation takes exactly one.
    pub fn range(&self) -> GpuRange {
        GpuRange {
            start: self.address,
            size: self.stride,
        }
    }

    pub fn strided_range(&self) -> GpuStridedRange {
        GpuStridedRange {
            start: self.address,
            size: self.size(),
            stride: self.stride,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::headless::HeadlessDevice;
    use crate::device::StateObjectDesc;
    use crate::pipeline::RootSignatureLayout;

    fn state_object(device: &mut HeadlessDevice) -> StateObjectId {
        let root_signature = device
            .create_root_signature(&RootSignatureLayout::default())
            .unwrap();

        device
            .create_state_object(&StateObjectDesc {
                library: &[],
                hit_groups: &[],
                payload_size: 16,
                attribute_size: 8,
                root_signature,
                max_recursion_depth: 1,
            })
            .unwrap()
    }

    #[test]
    fn stride_rounds_identifier_up() {
        let caps = Capabilities {
            shader_identifier_size: 40,
            ..Capabilities::default()
        };

        assert_eq!(32, record_stride(&Capabilities::default()));
        assert_eq!(64, record_stride(&caps));
    }

    #[test]
    fn records_are_packed_at_stride() {
        let mut device = HeadlessDevice::with_capabilities(Capabilities {
            shader_identifier_size: 40,
            ..Capabilities::default()
        });
        let so = state_object(&mut device);

        let table = ShaderTable::build(&mut device, "Miss", so, &["MissMain", "MissShadow"]).unwrap();

        assert_eq!(64, table.stride());
        assert_eq!(128, table.size());

        let data = device.buffer_data(table.buffer()).unwrap();
        let shadow = device.shader_identifier(so, "MissShadow").unwrap();

        assert_eq!(128, data.len());
        assert_eq!(&shadow.0[..], &data[64..104]);
        assert!(data[104..].iter().all(|&byte| byte == 0));
    }

    #[test]
    fn missing_identifier_is_an_error() {
        let mut device = HeadlessDevice::new();
        let so = state_object(&mut device);

        device.hide_export("HitGroup");

        assert!(matches!(
            ShaderTable::build(&mut device, "HitGroup", so, &["HitGroup"]),
            Err(Error::MissingShaderIdentifier(export)) if export == "HitGroup"
        ));
        assert!(matches!(
            ShaderTable::build::<_, &str>(&mut device, "Miss", so, &[]),
            Err(Error::Contract(ContractViolation::EmptyShaderTable("Miss")))
        ));
    }
}
