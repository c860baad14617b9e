mod code_buffer;
