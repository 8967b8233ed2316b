use anyhow::Result;
use ash::vk;

use crate::backend::vulkan::instance::Instance;
use crate::backend::vulkan::util::wrap_c_str;

/// Forwards validation layer messages to the `log` crate.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct DebugMessenger {
    handle: vk::DebugUtilsMessengerEXT,
    #[derivative(Debug = "ignore")]
    functions: ash::extensions::ext::DebugUtils,
}

impl DebugMessenger {
    pub fn new(instance: &Instance) -> Result<Self> {
        let functions = ash::extensions::ext::DebugUtils::new(unsafe { instance.loader() }, instance);
        let info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR)
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vk_debug_callback));
        let handle = unsafe { functions.create_debug_utils_messenger(&info, None)? };
        Ok(DebugMessenger {
            handle,
            functions,
        })
    }

    /// Function pointers of `VK_EXT_debug_utils`, used to attach debug names to objects.
    pub fn functions(&self) -> &ash::extensions::ext::DebugUtils {
        &self.functions
    }
}

impl Drop for DebugMessenger {
    fn drop(&mut self) {
        unsafe {
            self.functions.destroy_debug_utils_messenger(self.handle, None);
        }
    }
}

extern "system" fn vk_debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    msg_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the validation layer passes a valid callback data pointer for the duration of the call.
    let callback_data = unsafe { *p_callback_data };
    let id = unsafe { wrap_c_str(callback_data.p_message_id_name) };
    let message = unsafe { wrap_c_str(callback_data.p_message) };
    let number = callback_data.message_id_number;

    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => error!("[{msg_type:?}]: {id} ({number}): {message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => warn!("[{msg_type:?}]: {id} ({number}): {message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => info!("[{msg_type:?}]: {id} ({number}): {message}"),
        _ => trace!("[{msg_type:?}]: {id} ({number}): {message}"),
    };

    vk::FALSE
}
